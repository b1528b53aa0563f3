//! Work Loop (spec.md §4.6): the top-level pump. Single logical scheduler
//! thread; owns the `JobSpec` and drives Admission/Supervisor/Sampler each
//! tick. Installs a SIGINT handler for orderly shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::admission::AdmissionController;
use crate::calibrator::CalibrationStrategy;
use crate::sampler::ResourceSampler;
use crate::schema::{InputFile, JobSpec, RunSummary, SCHEMA_VERSION};
use crate::supervisor::{ChildSupervisor, MissingInputError};

const IDLE_SLEEP: Duration = Duration::from_millis(100);

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigint(_: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install the SIGINT handler once per process. Idempotent.
pub fn install_sigint_handler() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
fn reset_shutdown_flag_for_tests() {
    SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
}

/// Try to admit and start as many manifest entries as the Admission
/// Controller currently allows. Entries already active or settled are
/// skipped; a retry-eligible entry is neither active nor settled, so it is
/// naturally re-admitted here too — except on the very tick its failure was
/// discovered: `deferred_this_tick` withholds those so a retry is never
/// re-admitted earlier than the following outer iteration (spec.md §9).
fn fill_available_slots(
    manifest: &[InputFile],
    job_spec: &JobSpec,
    admission: &AdmissionController,
    supervisor: &mut ChildSupervisor,
    sampler: &mut ResourceSampler,
    deferred_this_tick: &HashSet<InputFile>,
) -> anyhow::Result<()> {
    for input_file in manifest {
        if supervisor.is_settled_or_active(input_file) || deferred_this_tick.contains(input_file) {
            continue;
        }
        let snapshot = sampler.host_snapshot();
        if !admission.may_start(supervisor.active_count(), snapshot, job_spec) {
            break;
        }
        match supervisor.start(input_file.clone(), job_spec, sampler) {
            Ok(_) => {}
            Err(e) => {
                if e.downcast_ref::<MissingInputError>().is_some() {
                    info!(input = %input_file, "input missing, recorded as terminal failure");
                } else {
                    return Err(e);
                }
            }
        }
    }
    Ok(())
}

fn all_settled(manifest: &[InputFile], supervisor: &ChildSupervisor) -> bool {
    manifest.iter().all(|f| supervisor.is_settled_or_active(f)) && supervisor.active_count() == 0
}

/// Drive the manifest to completion. Returns the process exit code
/// (0 = every entry completed, 1 = shutdown or any terminal failure).
pub fn run(
    job_spec: &JobSpec,
    manifest: Vec<InputFile>,
    calibrator: &dyn CalibrationStrategy,
) -> anyhow::Result<i32> {
    let started = Instant::now();
    let total = manifest.len();

    let mut sampler = ResourceSampler::new(&job_spec.output_dir);
    let mut admission = AdmissionController::new(job_spec.max_processes_cap);
    let mut supervisor = ChildSupervisor::new();

    if let Some(probe_input) = manifest.first() {
        if let Some(limits) = calibrator.calibrate(probe_input, job_spec) {
            info!(
                max_processes = limits.max_processes,
                "calibration complete, applying proposed concurrency cap"
            );
            admission.apply_calibrated_cap(limits.max_processes);
        }
    }

    let mut shutting_down = false;

    loop {
        if shutdown_requested() && !shutting_down {
            info!("SIGINT received, draining active children");
            shutting_down = true;
            supervisor.shutdown_all();
        }

        let newly_retryable: HashSet<InputFile> =
            supervisor.reap_all(job_spec, &mut sampler)?.into_iter().collect();

        if let Some(snapshot) = sampler.refresh() {
            supervisor.refresh_usage(&sampler);
            for input_file in supervisor.active_inputs() {
                if let Some(record) = supervisor.record(&input_file) {
                    debug!(
                        input = %input_file,
                        cpu_pct = record.last_cpu_pct,
                        rss_bytes = record.last_rss_bytes,
                        "active child resource usage"
                    );
                }
            }
            admission.observe(supervisor.active_count(), snapshot, job_spec);
        }

        if !shutting_down {
            fill_available_slots(
                &manifest,
                job_spec,
                &admission,
                &mut supervisor,
                &mut sampler,
                &newly_retryable,
            )?;
        }

        if shutting_down && supervisor.active_count() == 0 {
            break;
        }
        if !shutting_down && all_settled(&manifest, &supervisor) {
            break;
        }

        std::thread::sleep(IDLE_SLEEP);
    }

    let completed = supervisor.completed().len();
    let terminal_failures = supervisor.terminal_failures().len();
    let exit_code = if shutting_down || terminal_failures > 0 || completed != total {
        1
    } else {
        0
    };

    info!(completed, terminal_failures, total, exit_code, "run finished");

    RunSummary {
        schema_version: SCHEMA_VERSION,
        ok: exit_code == 0,
        completed,
        terminal_failures,
        total,
        exit_code,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
    .print();

    Ok(exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibrator::NoopCalibrator;
    use std::path::PathBuf;

    fn spec_for(binary: &str, output_dir: &std::path::Path) -> JobSpec {
        JobSpec {
            binary_path: PathBuf::from(binary),
            flags: vec![],
            output_dir: output_dir.to_path_buf(),
            output_suffix: ".out".into(),
            cpu_percent_max: 100.0,
            memory_percent_max: 100.0,
            disk_percent_max: 100.0,
            max_processes_cap: 2,
            max_retries: 3,
        }
    }

    #[test]
    fn empty_manifest_exits_zero() {
        reset_shutdown_flag_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/bin/true", dir.path());
        let code = run(&spec, vec![], &NoopCalibrator).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn all_succeed_exits_zero() {
        reset_shutdown_flag_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/bin/true", dir.path());
        let mut manifest = vec![];
        for name in ["a.txt", "b.txt", "c.txt"] {
            let p = dir.path().join(name);
            std::fs::write(&p, b"hi").unwrap();
            manifest.push(InputFile::new(p));
        }
        let code = run(&spec, manifest, &NoopCalibrator).unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn missing_input_is_terminal_failure_and_exit_one() {
        reset_shutdown_flag_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/bin/true", dir.path());
        let manifest = vec![InputFile::new(dir.path().join("nonexistent.txt"))];
        let code = run(&spec, manifest, &NoopCalibrator).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn all_fail_exhausts_retries_and_exits_one() {
        reset_shutdown_flag_for_tests();
        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_for("/bin/false", dir.path());
        spec.max_retries = 2;
        let p = dir.path().join("x.txt");
        std::fs::write(&p, b"hi").unwrap();
        let manifest = vec![InputFile::new(p)];
        let code = run(&spec, manifest, &NoopCalibrator).unwrap();
        assert_eq!(code, 1);
    }

    #[test]
    fn retry_is_withheld_on_the_tick_it_was_discovered() {
        use crate::sampler::ResourceSampler;
        use crate::supervisor::ChildSupervisor;

        let dir = tempfile::tempdir().unwrap();
        let mut spec = spec_for("/bin/false", dir.path());
        spec.max_retries = 5;
        let p = dir.path().join("x.txt");
        std::fs::write(&p, b"hi").unwrap();
        let input = InputFile::new(p);
        let manifest = vec![input.clone()];

        let mut sampler = ResourceSampler::new(dir.path());
        let mut supervisor = ChildSupervisor::new();
        let admission = AdmissionController::new(spec.max_processes_cap);

        supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let newly_retryable: HashSet<InputFile> =
            supervisor.reap_all(&spec, &mut sampler).unwrap().into_iter().collect();
        assert!(newly_retryable.contains(&input));

        // Same tick: the deferred set must withhold the retry.
        fill_available_slots(&manifest, &spec, &admission, &mut supervisor, &mut sampler, &newly_retryable)
            .unwrap();
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.retry_count(&input), 1);

        // Next tick: nothing is deferred, so the retry is admitted.
        fill_available_slots(&manifest, &spec, &admission, &mut supervisor, &mut sampler, &HashSet::new())
            .unwrap();
        assert_eq!(supervisor.active_count(), 1);
    }
}
