//! Calibrator (spec.md §4.4): a one-shot probe that proposes safe ceilings
//! before the main run.
//!
//! Ported directly from the original `orchestrator/resource_calibration.py`
//! (`ResourceCalibrator` ABC, `NoopCalibrator`, `ProcessCalibrator`): the
//! stabilization loop (three consecutive samples within 1.0 percentage
//! point, give up after 10 polls), the one-second settle read, and the
//! cap/ceiling arithmetic with 20% headroom are all taken from that source
//! unchanged.

use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{error, info};

use crate::command_builder;
use crate::schema::{InputFile, JobSpec, ProposedLimits};

const STABILITY_EPSILON_PCT: f64 = 1.0;
const STABILITY_STREAK: u32 = 3;
const MAX_POLL_ATTEMPTS: u32 = 10;
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Strategy interface mirroring the Python `ResourceCalibrator` ABC: a probe
/// variant and a no-op variant, selectable by configuration.
pub trait CalibrationStrategy {
    fn calibrate(&self, probe_input: &InputFile, spec: &JobSpec) -> Option<ProposedLimits>;
}

/// Calibration disabled: defaults in `JobSpec` stand unchanged.
pub struct NoopCalibrator;

impl CalibrationStrategy for NoopCalibrator {
    fn calibrate(&self, _probe_input: &InputFile, _spec: &JobSpec) -> Option<ProposedLimits> {
        None
    }
}

/// Launches one probe child, waits for its CPU% to stabilize, and derives
/// concurrency/ceiling proposals from measured usage and host capacity
/// (spec.md §4.4).
pub struct ProbeCalibrator;

impl CalibrationStrategy for ProbeCalibrator {
    fn calibrate(&self, probe_input: &InputFile, spec: &JobSpec) -> Option<ProposedLimits> {
        info!(input = %probe_input, "calibrating resource usage with probe input");

        let built = command_builder::build(spec, probe_input);
        let mut child = match spawn_probe(&built) {
            Some(child) => child,
            None => {
                error!("failed to start calibration process");
                return None;
            }
        };
        let pid = child.id();

        let mut sys = System::new();
        let stabilized = wait_for_stable_cpu(&mut sys, pid);

        let result = if stabilized {
            measure_and_propose(&mut sys, pid, probe_input, spec)
        } else {
            error!("probe process did not stabilize before giving up");
            None
        };

        terminate_probe(&mut child);
        result
    }
}

fn spawn_probe(built: &command_builder::BuiltCommand) -> Option<std::process::Child> {
    let mut cmd = if built.needs_shell {
        let mut c = std::process::Command::new("/bin/sh");
        c.arg("-c").arg(command_builder::to_shell_command(built));
        c
    } else {
        let mut c = std::process::Command::new(&built.argv[0]);
        c.args(&built.argv[1..]);
        c
    };
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .ok()
}

/// Poll CPU% every iteration; "stable" once three consecutive samples change
/// by less than 1.0 percentage point. Give up after 10 polls.
fn wait_for_stable_cpu(sys: &mut System, pid: u32) -> bool {
    let sysinfo_pid = Pid::from_u32(pid);
    let mut last_cpu = 0.0f64;
    let mut stable_count = 0u32;

    for _ in 0..MAX_POLL_ATTEMPTS {
        sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);
        let Some(process) = sys.process(sysinfo_pid) else {
            return false;
        };
        let current_cpu = process.cpu_usage() as f64;
        if (current_cpu - last_cpu).abs() < STABILITY_EPSILON_PCT {
            stable_count += 1;
            if stable_count >= STABILITY_STREAK {
                return true;
            }
        } else {
            stable_count = 0;
        }
        last_cpu = current_cpu;
    }
    false
}

fn measure_and_propose(
    sys: &mut System,
    pid: u32,
    probe_input: &InputFile,
    spec: &JobSpec,
) -> Option<ProposedLimits> {
    let sysinfo_pid = Pid::from_u32(pid);

    // One-second-interval settle read, per spec.md §4.4 step 3.
    std::thread::sleep(Duration::from_secs(1));
    sys.refresh_processes(ProcessesToUpdate::Some(&[sysinfo_pid]), true);
    let process = sys.process(sysinfo_pid)?;
    let measured_cpu = process.cpu_usage() as f64;
    let rss = process.memory().max(1024);

    sys.refresh_cpu_usage();
    sys.refresh_memory();
    let cpu_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1);
    let total_memory = sys.total_memory().max(1);

    let disks = sysinfo::Disks::new_with_refreshed_list();
    let free_disk = disks
        .list()
        .iter()
        .filter(|d| spec.output_dir.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .unwrap_or(u64::MAX);

    let probe_size = std::fs::metadata(probe_input.as_path())
        .map(|m| m.len())
        .unwrap_or(0);
    let estimated_output_size = (probe_size * 2).max(1024);

    let cap_cpu = ((cpu_count as f64) * 0.8).floor().max(1.0) as usize;
    let cap_mem = (((total_memory as f64) * 0.8) / (rss as f64)).floor().max(1.0) as usize;
    let cap_disk = (((free_disk as f64) * 0.8) / (estimated_output_size as f64))
        .floor()
        .max(1.0) as usize;

    let max_processes = cap_cpu.min(cap_mem).min(cap_disk).max(1);

    let cpu_percent = measured_cpu.max(1.0) * 1.2;
    let memory_percent = (rss as f64 / total_memory as f64) * 100.0 * 1.2;
    let disk_percent = (estimated_output_size as f64 / free_disk.max(1) as f64) * 100.0 * 1.2;

    info!(
        max_processes,
        cpu_percent, memory_percent, disk_percent, "calibration summary"
    );

    Some(ProposedLimits {
        cpu_percent,
        memory_percent,
        disk_percent,
        max_processes,
    })
}

fn terminate_probe(child: &mut std::process::Child) {
    #[cfg(unix)]
    {
        // SAFETY: sending SIGTERM to our own freshly-spawned child's pid.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
    }
    let deadline = Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => return,
        }
    }
}
