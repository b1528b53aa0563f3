//! Configuration loading (spec.md §2 item 7, §4 addendum): a TOML file
//! supplies the binary/flags/resource defaults; CLI flags layer on top for
//! the fields the original `process_orchestrator_main.py` exposed as
//! overrides (`--max-cpu-percent`, `--max-memory-percent`, `--max-processes`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::schema::{InputFile, JobSpec};

/// On-disk shape of the TOML config file. Mirrors the original `Config`'s
/// `BinaryConfig`/`DirectoryConfig` split, flattened into the fields this
/// crate actually needs.
#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    binary: BinarySection,
    #[serde(default)]
    resources: ResourcesSection,
}

#[derive(Debug, Deserialize, Default)]
struct BinarySection {
    path: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    output_suffix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ResourcesSection {
    max_cpu_percent: Option<f64>,
    max_memory_percent: Option<f64>,
    max_disk_percent: Option<f64>,
    max_processes: Option<usize>,
    max_retries: Option<u32>,
}

/// CLI-supplied overrides, applied after the file config (spec.md §2 item 7).
/// Every field is optional: `None` means "use the file value or default".
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub max_cpu_percent: Option<f64>,
    pub max_memory_percent: Option<f64>,
    pub max_processes: Option<usize>,
    pub output_dir: Option<PathBuf>,
}

/// Load a `JobSpec` from a TOML file on disk, applying CLI overrides on top.
/// Fails if the config file is missing or malformed, or if the resulting
/// spec is internally contradictory (spec.md §7 "Configuration defect").
pub fn load(config_path: &Path, overrides: ConfigOverrides) -> Result<JobSpec> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("read config file {}", config_path.display()))?;
    let parsed: FileConfig =
        toml::from_str(&raw).with_context(|| format!("parse config file {}", config_path.display()))?;

    let defaults = JobSpec::default();

    let mut spec = JobSpec {
        binary_path: parsed
            .binary
            .path
            .map(PathBuf::from)
            .unwrap_or(defaults.binary_path),
        flags: parsed.binary.flags,
        output_dir: overrides.output_dir.unwrap_or(defaults.output_dir),
        output_suffix: parsed.binary.output_suffix.unwrap_or(defaults.output_suffix),
        cpu_percent_max: parsed
            .resources
            .max_cpu_percent
            .unwrap_or(defaults.cpu_percent_max),
        memory_percent_max: parsed
            .resources
            .max_memory_percent
            .unwrap_or(defaults.memory_percent_max),
        disk_percent_max: parsed
            .resources
            .max_disk_percent
            .unwrap_or(defaults.disk_percent_max),
        max_processes_cap: parsed
            .resources
            .max_processes
            .unwrap_or(defaults.max_processes_cap),
        max_retries: parsed.resources.max_retries.unwrap_or(defaults.max_retries),
    };

    if let Some(cpu) = overrides.max_cpu_percent {
        spec.cpu_percent_max = cpu;
    }
    if let Some(mem) = overrides.max_memory_percent {
        spec.memory_percent_max = mem;
    }
    if let Some(cap) = overrides.max_processes {
        spec.max_processes_cap = cap;
    }

    validate(&spec)?;
    Ok(spec)
}

/// Configuration-defect checks verifiable from the `JobSpec` alone: a binary
/// path that isn't set, and a non-positive concurrency cap. The
/// `output_dir`/input-directory collision check (spec.md §3) needs the
/// manifest and is performed separately by
/// [`validate_against_manifest`] once it has been read.
fn validate(spec: &JobSpec) -> Result<()> {
    if spec.binary_path.as_os_str().is_empty() {
        bail!("configuration defect: binary.path is not set");
    }
    if spec.max_processes_cap == 0 {
        bail!("configuration defect: resources.max_processes must be at least 1");
    }
    Ok(())
}

/// Configuration-defect check requiring the manifest (spec.md §3: "Empty
/// allowed only if `output_dir` differs from the input's directory"). Call
/// this once after `manifest::read` so every entry's parent directory can be
/// compared against `output_dir` when `output_suffix` is empty.
pub fn validate_against_manifest(spec: &JobSpec, manifest: &[InputFile]) -> Result<()> {
    if !spec.output_suffix.is_empty() {
        return Ok(());
    }
    for input in manifest {
        if input.as_path().parent() == Some(spec.output_dir.as_path()) {
            bail!(
                "configuration defect: output_dir {} matches the directory of input {} with an empty output_suffix",
                spec.output_dir.display(),
                input
            );
        }
    }
    Ok(())
}
