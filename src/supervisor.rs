//! Child Supervisor (spec.md §4.5): owns the active-children map, forks and
//! reaps children, classifies exits, and drives retry accounting.
//!
//! The fork/capture approach follows `tumf-agent-exec::run::supervise`
//! (piped stdout/stderr, drained on exit); the admit/reject/retry rules
//! follow `orchestrator/process_manager.py`'s `ProcessManager`
//! (`start_process` rejecting an already-tracked input, raising on a
//! missing input file, and `stop_process`'s terminate-then-wait(5s)
//! shutdown).

use std::collections::{HashMap, HashSet};
use std::io::Read;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::command_builder::{self, BuiltCommand};
use crate::sampler::ResourceSampler;
use crate::schema::{ChildRecord, ChildState, InputFile, JobSpec, PollOutcome};

const GRACEFUL_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

struct RunningChild {
    record: ChildRecord,
    child: std::process::Child,
    stdout: Option<std::process::ChildStdout>,
    stderr: Option<std::process::ChildStderr>,
}

/// Raised by `start()` when the input file does not exist on disk
/// (spec.md §4.5, §7 "Missing input" — not a retryable outcome). A plain
/// marker type so callers can `downcast_ref` it out of the `anyhow::Error`
/// the way `tumf-agent-exec`'s main loop distinguishes `JobNotFound`.
#[derive(Debug)]
pub struct MissingInputError(pub String);

impl std::fmt::Display for MissingInputError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "input file not found: {}", self.0)
    }
}

impl std::error::Error for MissingInputError {}

pub struct ChildSupervisor {
    active: HashMap<InputFile, RunningChild>,
    retry_counts: HashMap<InputFile, u32>,
    completed: HashSet<InputFile>,
    terminal_failures: HashSet<InputFile>,
}

impl ChildSupervisor {
    pub fn new() -> Self {
        ChildSupervisor {
            active: HashMap::new(),
            retry_counts: HashMap::new(),
            completed: HashSet::new(),
            terminal_failures: HashSet::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_settled_or_active(&self, input_file: &InputFile) -> bool {
        self.active.contains_key(input_file)
            || self.completed.contains(input_file)
            || self.terminal_failures.contains(input_file)
    }

    pub fn completed(&self) -> &HashSet<InputFile> {
        &self.completed
    }

    pub fn terminal_failures(&self) -> &HashSet<InputFile> {
        &self.terminal_failures
    }

    pub fn retry_count(&self, input_file: &InputFile) -> u32 {
        self.retry_counts.get(input_file).copied().unwrap_or(0)
    }

    /// Inputs currently in the active map, for callers that want to iterate
    /// live children (e.g. to log their current resource usage).
    pub fn active_inputs(&self) -> Vec<InputFile> {
        self.active.keys().cloned().collect()
    }

    /// Copy each active child's latest CPU%/RSS from the Sampler onto its
    /// `ChildRecord` (spec.md §3: "updated on each sampler tick"). Call this
    /// whenever `ResourceSampler::refresh` produced a fresh sample.
    pub fn refresh_usage(&mut self, sampler: &ResourceSampler) {
        for (input_file, running) in self.active.iter_mut() {
            if let Some(usage) = sampler.child_usage(input_file) {
                running.record.last_cpu_pct = usage.cpu_percent;
                running.record.last_rss_bytes = usage.rss_bytes;
            }
        }
    }

    /// spec.md §4.5 `start()`. Returns `Ok(None)` when the input is already
    /// tracked or settled (not an error); returns `Err` only for a missing
    /// input file. Fork errors are swallowed here: the file is moved
    /// straight to `terminal_failures` and `Ok(None)` is returned, matching
    /// "any fork-time exception... must not propagate past the Supervisor".
    pub fn start(
        &mut self,
        input_file: InputFile,
        job_spec: &JobSpec,
        sampler: &mut ResourceSampler,
    ) -> Result<Option<()>> {
        if self.is_settled_or_active(&input_file) {
            return Ok(None);
        }

        if !input_file.as_path().exists() {
            return Err(MissingInputError(input_file.to_string()).into());
        }

        std::fs::create_dir_all(&job_spec.output_dir)
            .with_context(|| format!("create output dir {}", job_spec.output_dir.display()))?;

        let built = command_builder::build(job_spec, &input_file);
        let output_file = command_builder::output_path(job_spec, &input_file);

        match spawn(&built) {
            Ok(mut child) => {
                let pid = child.id();
                let stdout = child.stdout.take();
                let stderr = child.stderr.take();
                let record = ChildRecord {
                    input_file: input_file.clone(),
                    output_file,
                    pid,
                    start_time: std::time::Instant::now(),
                    last_cpu_pct: 0.0,
                    last_rss_bytes: 0,
                    state: ChildState::Running,
                };
                sampler.register(input_file.clone(), pid);
                info!(input = %input_file, pid, "child started");
                self.active.insert(
                    input_file,
                    RunningChild {
                        record,
                        child,
                        stdout,
                        stderr,
                    },
                );
                Ok(Some(()))
            }
            Err(e) => {
                warn!(input = %input_file, error = %e, "fork failed, terminal failure");
                self.terminal_failures.insert(input_file);
                Ok(None)
            }
        }
    }

    /// spec.md §4.5 `poll()`. Non-blocking: uses `try_wait`.
    pub fn poll(
        &mut self,
        input_file: &InputFile,
        job_spec: &JobSpec,
        sampler: &mut ResourceSampler,
    ) -> Result<PollOutcome> {
        let running = match self.active.get_mut(input_file) {
            Some(r) => r,
            None => return Ok(PollOutcome::StillRunning),
        };

        let status = match running.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return Ok(PollOutcome::StillRunning),
            Err(e) => {
                warn!(input = %input_file, error = %e, "wait() failed, treating as still running");
                return Ok(PollOutcome::StillRunning);
            }
        };

        let mut running = self.active.remove(input_file).expect("checked above");
        let (stdout, stderr) = drain_output(&mut running);
        sampler.unregister(input_file);

        if status.success() {
            running.record.state = ChildState::Succeeded;
            info!(
                input = %input_file,
                cpu_pct = running.record.last_cpu_pct,
                rss_bytes = running.record.last_rss_bytes,
                "child succeeded"
            );
            self.completed.insert(input_file.clone());
            Ok(PollOutcome::Succeeded)
        } else {
            let code = status.code().unwrap_or(-1);
            let attempt = self.retry_counts.entry(input_file.clone()).or_insert(0);
            *attempt += 1;
            warn!(
                input = %input_file,
                code,
                attempt = *attempt,
                stdout = %non_empty_or_placeholder(&stdout),
                stderr = %non_empty_or_placeholder(&stderr),
                "child exited non-zero"
            );
            if *attempt >= job_spec.max_retries {
                running.record.state = ChildState::Terminal;
                self.terminal_failures.insert(input_file.clone());
                info!(input = %input_file, "retries exhausted, terminal failure");
                Ok(PollOutcome::FailedTerminal)
            } else {
                running.record.state = ChildState::Failed;
                Ok(PollOutcome::FailedRetryable)
            }
        }
    }

    /// spec.md §4.5 `reap_all()`. Iterates a snapshot so the active map may
    /// change (children complete) during iteration. Returns the inputs that
    /// became retry-eligible on this call, so the caller can withhold them
    /// from admission until the following tick (spec.md §9 open question:
    /// a retry is never re-admitted within the same tick it was discovered).
    pub fn reap_all(&mut self, job_spec: &JobSpec, sampler: &mut ResourceSampler) -> Result<Vec<InputFile>> {
        let inputs: Vec<InputFile> = self.active.keys().cloned().collect();
        let mut newly_retryable = Vec::new();
        for input_file in inputs {
            if self.poll(&input_file, job_spec, sampler)? == PollOutcome::FailedRetryable {
                newly_retryable.push(input_file);
            }
        }
        Ok(newly_retryable)
    }

    /// Graceful shutdown on SIGINT: terminate all active children (5s
    /// graceful, then force-kill), per spec.md §4.6.
    pub fn shutdown_all(&mut self) {
        for (input_file, running) in self.active.iter_mut() {
            #[cfg(unix)]
            {
                // SAFETY: pid belongs to a child we spawned and still own.
                unsafe {
                    libc::kill(running.child.id() as libc::pid_t, libc::SIGTERM);
                }
            }
            let deadline = std::time::Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
            loop {
                match running.child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {
                        if std::time::Instant::now() >= deadline {
                            let _ = running.child.kill();
                            let _ = running.child.wait();
                            break;
                        }
                        std::thread::sleep(std::time::Duration::from_millis(50));
                    }
                    Err(_) => break,
                }
            }
            info!(input = %input_file, "child terminated for shutdown");
        }
        self.active.clear();
    }

    /// Current child record for a given active input, used by callers that
    /// want to surface resource usage alongside lifecycle state.
    pub fn record(&self, input_file: &InputFile) -> Option<&ChildRecord> {
        self.active.get(input_file).map(|r| &r.record)
    }
}

impl Default for ChildSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn(built: &BuiltCommand) -> std::io::Result<std::process::Child> {
    if built.needs_shell {
        std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(command_builder::to_shell_command(built))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
    } else {
        std::process::Command::new(&built.argv[0])
            .args(&built.argv[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
    }
}

fn drain_output(running: &mut RunningChild) -> (String, String) {
    let mut stdout_buf = String::new();
    if let Some(mut stdout) = running.stdout.take() {
        let _ = stdout.read_to_string(&mut stdout_buf);
    }
    let mut stderr_buf = String::new();
    if let Some(mut stderr) = running.stderr.take() {
        let _ = stderr.read_to_string(&mut stderr_buf);
    }
    (stdout_buf, stderr_buf)
}

fn non_empty_or_placeholder(s: &str) -> &str {
    if s.trim().is_empty() { "<no output>" } else { s }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec_for(binary: &str, flags: Vec<&str>, output_dir: &std::path::Path) -> JobSpec {
        JobSpec {
            binary_path: PathBuf::from(binary),
            flags: flags.into_iter().map(String::from).collect(),
            output_dir: output_dir.to_path_buf(),
            output_suffix: ".out".into(),
            max_retries: 3,
            ..JobSpec::default()
        }
    }

    #[test]
    fn start_rejects_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let spec = spec_for("/bin/true", vec![], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::new(dir.path());
        let input = InputFile::new("/nonexistent/nope.txt");
        let result = supervisor.start(input, &spec, &mut sampler);
        assert!(result.is_err());
    }

    #[test]
    fn successful_child_completes() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.txt");
        std::fs::write(&input_path, b"hello").unwrap();
        let spec = spec_for("/bin/true", vec![], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::new(dir.path());
        let input = InputFile::new(input_path);

        supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        // Give the child a moment to exit.
        std::thread::sleep(std::time::Duration::from_millis(100));
        let outcome = supervisor.poll(&input, &spec, &mut sampler).unwrap();
        assert_eq!(outcome, PollOutcome::Succeeded);
        assert!(supervisor.completed().contains(&input));
    }

    #[test]
    fn failing_child_retries_then_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.txt");
        std::fs::write(&input_path, b"hello").unwrap();
        let spec = spec_for("/bin/false", vec![], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::new(dir.path());
        let input = InputFile::new(input_path);

        for attempt in 1..=spec.max_retries {
            supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(100));
            let outcome = supervisor.poll(&input, &spec, &mut sampler).unwrap();
            if attempt < spec.max_retries {
                assert_eq!(outcome, PollOutcome::FailedRetryable);
            } else {
                assert_eq!(outcome, PollOutcome::FailedTerminal);
            }
        }
        assert!(supervisor.terminal_failures().contains(&input));
        assert_eq!(supervisor.retry_count(&input), spec.max_retries);
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.txt");
        std::fs::write(&input_path, b"hello").unwrap();
        let spec = spec_for("/bin/sleep", vec!["0.2"], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::new(dir.path());
        let input = InputFile::new(input_path);

        let first = supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        assert!(first.is_some());
        let second = supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn record_starts_running_and_appears_in_active_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.txt");
        std::fs::write(&input_path, b"hello").unwrap();
        let spec = spec_for("/bin/sleep", vec!["0.2"], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::new(dir.path());
        let input = InputFile::new(input_path);

        supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        assert_eq!(supervisor.active_inputs(), vec![input.clone()]);
        assert_eq!(supervisor.record(&input).unwrap().state, ChildState::Running);
    }

    #[test]
    fn refresh_usage_copies_sampler_readings_onto_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.txt");
        std::fs::write(&input_path, b"hello").unwrap();
        let spec = spec_for("/bin/sleep", vec!["0.3"], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::with_interval(dir.path(), std::time::Duration::from_millis(0));
        let input = InputFile::new(input_path);

        supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        sampler.refresh();
        supervisor.refresh_usage(&sampler);

        let record = supervisor.record(&input).unwrap();
        assert!(record.last_rss_bytes > 0);
    }

    #[test]
    fn record_is_removed_once_settled() {
        let dir = tempfile::tempdir().unwrap();
        let input_path = dir.path().join("a.txt");
        std::fs::write(&input_path, b"hello").unwrap();
        let spec = spec_for("/bin/true", vec![], dir.path());
        let mut supervisor = ChildSupervisor::new();
        let mut sampler = ResourceSampler::new(dir.path());
        let input = InputFile::new(input_path);

        supervisor.start(input.clone(), &spec, &mut sampler).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(100));
        supervisor.poll(&input, &spec, &mut sampler).unwrap();

        assert!(supervisor.record(&input).is_none());
        assert!(supervisor.active_inputs().is_empty());
    }
}
