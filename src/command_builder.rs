//! Pure command-line construction (spec.md §4.1).
//!
//! `build` takes a [`JobSpec`](crate::schema::JobSpec) and an
//! [`InputFile`](crate::schema::InputFile) and returns the argv to execute
//! plus a flag indicating whether the result must go through a shell. No I/O,
//! no errors: every input produces a deterministic output.

use std::path::PathBuf;

use crate::schema::{InputFile, JobSpec};

/// Whole-token shell operators. Matched only when a fully-expanded flag
/// equals one of these exactly — `"--out>log"` is not redirection, per the
/// Design Notes: callers that need real redirection pass the operator as its
/// own flag entry.
const SHELL_OPERATORS: &[&str] = &[">", ">>", "|", "<"];

/// Result of building a command for one input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltCommand {
    pub argv: Vec<String>,
    pub needs_shell: bool,
}

/// Compute the output path for `input_file` under `job_spec`'s output
/// directory and suffix (spec.md §3, §4.1).
pub fn output_path(job_spec: &JobSpec, input_file: &InputFile) -> PathBuf {
    let basename = input_file
        .as_path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    job_spec
        .output_dir
        .join(format!("{basename}{}", job_spec.output_suffix))
}

/// Build the argv (and shell requirement) for one input file. Pure: calling
/// this twice with identical arguments yields identical output
/// (spec.md §8 invariant 6).
pub fn build(job_spec: &JobSpec, input_file: &InputFile) -> BuiltCommand {
    let output_file = output_path(job_spec, input_file);
    let input_str = input_file.as_path().to_string_lossy();
    let output_str = output_file.to_string_lossy();

    let mut argv = Vec::with_capacity(job_spec.flags.len() + 1);
    argv.push(job_spec.binary_path.to_string_lossy().into_owned());

    for flag in &job_spec.flags {
        let expanded = flag
            .replace("{input_file}", &input_str)
            .replace("{output_file}", &output_str);
        argv.push(expanded);
    }

    let needs_shell = argv
        .iter()
        .skip(1)
        .any(|token| SHELL_OPERATORS.contains(&token.as_str()));

    BuiltCommand { argv, needs_shell }
}

/// Join argv into a single whitespace-separated command string for shell
/// execution when `needs_shell` is true (spec.md §4.1).
pub fn to_shell_command(built: &BuiltCommand) -> String {
    built.argv.join(" ")
}
