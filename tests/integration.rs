use std::fs;
use std::path::Path;

use filequeue_run::calibrator::NoopCalibrator;
use filequeue_run::schema::{InputFile, JobSpec};
use filequeue_run::work_loop;

fn spec_with_binary(binary: &str, output_dir: &Path) -> JobSpec {
    JobSpec {
        binary_path: binary.into(),
        flags: vec!["{input_file}".into(), "{output_file}".into()],
        output_dir: output_dir.to_path_buf(),
        output_suffix: ".out".into(),
        cpu_percent_max: 100.0,
        memory_percent_max: 100.0,
        disk_percent_max: 100.0,
        max_processes_cap: 2,
        max_retries: 2,
    }
}

fn manifest_of(dir: &Path, names: &[&str]) -> Vec<InputFile> {
    names
        .iter()
        .map(|name| {
            let path = dir.join(name);
            fs::write(&path, b"payload").unwrap();
            InputFile::new(path)
        })
        .collect()
}

/// S1: a small manifest where every entry's binary invocation succeeds.
#[test]
fn s1_all_entries_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec_with_binary("/bin/cp", dir.path());
    let manifest = manifest_of(dir.path(), &["one.txt", "two.txt", "three.txt"]);

    let exit_code = work_loop::run(&spec, manifest, &NoopCalibrator).unwrap();
    assert_eq!(exit_code, 0);

    for name in ["one.txt", "two.txt", "three.txt"] {
        let produced = dir.path().join(format!("{name}.out"));
        assert!(produced.exists(), "expected {produced:?} to exist");
    }
}

/// S3: a manifest entry pointing at a file that was never created; this
/// must be recorded as a terminal failure without a fork attempt.
#[test]
fn s3_missing_input_is_reported_without_spawning() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec_with_binary("/bin/cp", dir.path());
    let manifest = vec![InputFile::new(dir.path().join("never_created.txt"))];

    let exit_code = work_loop::run(&spec, manifest, &NoopCalibrator).unwrap();
    assert_eq!(exit_code, 1);
}

/// S4: every invocation of the configured binary exits non-zero; retries
/// are exhausted and the run as a whole reports failure.
#[test]
fn s4_persistent_failure_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let mut spec = spec_with_binary("/bin/false", dir.path());
    spec.max_retries = 3;
    let manifest = manifest_of(dir.path(), &["doomed.txt"]);

    let exit_code = work_loop::run(&spec, manifest, &NoopCalibrator).unwrap();
    assert_eq!(exit_code, 1);
}

/// A manifest that mixes a successful entry with a permanently-missing one:
/// the successful entry still completes even though the run overall fails.
#[test]
fn mixed_manifest_partial_success_still_fails_overall() {
    let dir = tempfile::tempdir().unwrap();
    let spec = spec_with_binary("/bin/cp", dir.path());
    let mut manifest = manifest_of(dir.path(), &["present.txt"]);
    manifest.push(InputFile::new(dir.path().join("absent.txt")));

    let exit_code = work_loop::run(&spec, manifest, &NoopCalibrator).unwrap();
    assert_eq!(exit_code, 1);
    assert!(dir.path().join("present.txt.out").exists());
}
