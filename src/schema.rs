//! Core data model (spec.md §3): `InputFile`, `JobSpec`, `ChildRecord`,
//! `ResourceSnapshot`, `ThrottleState`, and the final-run JSON envelope.
//!
//! All stdout output is a single JSON line, printed once at process exit.
//! Everything else (per-transition logging) goes through `tracing` to stderr.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SCHEMA_VERSION: &str = "1.0";

/// Absolute path to a manifest entry. Used as the key for every map the core
/// keeps (active children, retry counters, outcome sets).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InputFile(PathBuf);

impl InputFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        InputFile(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn display(&self) -> std::path::Display<'_> {
        self.0.display()
    }
}

impl std::fmt::Display for InputFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Configuration for the binary to execute and its resource ceilings.
/// Immutable after construction (spec.md §3).
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub binary_path: PathBuf,
    pub flags: Vec<String>,
    pub output_dir: PathBuf,
    pub output_suffix: String,
    pub cpu_percent_max: f64,
    pub memory_percent_max: f64,
    pub disk_percent_max: f64,
    pub max_processes_cap: usize,
    pub max_retries: u32,
}

impl Default for JobSpec {
    fn default() -> Self {
        JobSpec {
            binary_path: PathBuf::new(),
            flags: Vec::new(),
            output_dir: PathBuf::new(),
            output_suffix: String::new(),
            cpu_percent_max: 80.0,
            memory_percent_max: 80.0,
            disk_percent_max: 90.0,
            max_processes_cap: 4,
            max_retries: 3,
        }
    }
}

/// Snapshot of host-wide resource utilization (spec.md §4.2). All fields are
/// percentages in `[0, 100]`. `disk_percent` is measured on the volume
/// backing `output_dir`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceSnapshot {
    /// `max(observed/ceiling)` across the three dimensions (GLOSSARY: pressure).
    pub fn pressure(&self, spec: &JobSpec) -> f64 {
        let cpu_ratio = ratio(self.cpu_percent, spec.cpu_percent_max);
        let mem_ratio = ratio(self.memory_percent, spec.memory_percent_max);
        let disk_ratio = ratio(self.disk_percent, spec.disk_percent_max);
        cpu_ratio.max(mem_ratio).max(disk_ratio)
    }

    /// `min(ceiling/observed)` across the three dimensions, used to size the
    /// throttled cap (spec.md §4.3).
    pub fn min_ratio(&self, spec: &JobSpec) -> f64 {
        let cpu = inverse_ratio(spec.cpu_percent_max, self.cpu_percent);
        let mem = inverse_ratio(spec.memory_percent_max, self.memory_percent);
        let disk = inverse_ratio(spec.disk_percent_max, self.disk_percent);
        cpu.min(mem).min(disk)
    }
}

fn ratio(observed: f64, ceiling: f64) -> f64 {
    if ceiling <= 0.0 { f64::INFINITY } else { observed / ceiling }
}

fn inverse_ratio(ceiling: f64, observed: f64) -> f64 {
    if observed <= 0.0 { f64::INFINITY } else { ceiling / observed }
}

/// Throttling state owned by the Admission Controller (spec.md §3, §4.3).
#[derive(Debug, Clone)]
pub struct ThrottleState {
    pub throttled: bool,
    pub original_max_processes: usize,
    pub effective_max_processes: usize,
}

impl ThrottleState {
    pub fn new(original_max_processes: usize) -> Self {
        ThrottleState {
            throttled: false,
            original_max_processes,
            effective_max_processes: original_max_processes,
        }
    }
}

/// Lifecycle state of a single child (spec.md §4.5 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildState {
    Running,
    Succeeded,
    Failed,
    Terminal,
}

/// A single tracked child process (spec.md §3).
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub input_file: InputFile,
    pub output_file: PathBuf,
    pub pid: u32,
    pub start_time: std::time::Instant,
    pub last_cpu_pct: f64,
    pub last_rss_bytes: u64,
    pub state: ChildState,
}

/// Outcome of a single `poll()` call (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    StillRunning,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

/// Ceilings and concurrency cap proposed by the Calibrator (spec.md §4.4),
/// mirrored 1:1 on the original Python `ProcessCalibrator.calibrate` return
/// dict (`cpu_percent`, `memory_percent`, `disk_percent`, `max_processes`).
#[derive(Debug, Clone, Copy)]
pub struct ProposedLimits {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub max_processes: usize,
}

/// Final JSON line printed to stdout once the Work Loop terminates.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: &'static str,
    pub ok: bool,
    pub completed: usize,
    pub terminal_failures: usize,
    pub total: usize,
    pub exit_code: i32,
    pub elapsed_ms: u64,
}

impl RunSummary {
    pub fn print(&self) {
        println!(
            "{}",
            serde_json::to_string(self).expect("RunSummary serialization failed")
        );
    }
}
