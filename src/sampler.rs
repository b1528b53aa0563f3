//! Resource Sampler (spec.md §4.2): a stateless-across-calls observer of
//! host-global and per-child CPU/memory/disk counters.
//!
//! Grounded on the pack's `csa-resource::monitor` module, which polls a
//! single pid's memory via `sysinfo` on an interval; generalized here to
//! host-wide CPU/memory/disk plus a registry of tracked child pids, with the
//! debounced `refresh()` spec.md mandates.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

use sysinfo::{Disks, Pid, ProcessesToUpdate, System};
use tracing::debug;

use crate::schema::{InputFile, ResourceSnapshot};

const DEFAULT_MONITORING_INTERVAL: Duration = Duration::from_secs(5);

/// Per-child counters the Sampler maintains between reaps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildUsage {
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

/// Observes host-wide and per-child resource usage. Liveness is never
/// authoritative here: a vanished pid is silently dropped (spec.md §4.2,
/// §7 "Sampler transient error").
pub struct ResourceSampler {
    sys: System,
    disks: Disks,
    output_dir: std::path::PathBuf,
    monitoring_interval: Duration,
    last_refresh: Option<Instant>,
    registered: HashMap<InputFile, u32>,
    usage: HashMap<InputFile, ChildUsage>,
}

impl ResourceSampler {
    pub fn new(output_dir: impl AsRef<Path>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        ResourceSampler {
            sys,
            disks: Disks::new_with_refreshed_list(),
            output_dir: output_dir.as_ref().to_path_buf(),
            monitoring_interval: DEFAULT_MONITORING_INTERVAL,
            last_refresh: None,
            registered: HashMap::new(),
            usage: HashMap::new(),
        }
    }

    #[cfg(test)]
    pub fn with_interval(output_dir: impl AsRef<Path>, monitoring_interval: Duration) -> Self {
        let mut sampler = Self::new(output_dir);
        sampler.monitoring_interval = monitoring_interval;
        sampler
    }

    /// Begin tracking a child's per-process counters (spec.md §4.2).
    pub fn register(&mut self, input_file: InputFile, pid: u32) {
        self.registered.insert(input_file.clone(), pid);
        self.usage.insert(input_file, ChildUsage::default());
    }

    /// Stop tracking a child (spec.md §4.2).
    pub fn unregister(&mut self, input_file: &InputFile) {
        self.registered.remove(input_file);
        self.usage.remove(input_file);
    }

    /// Current per-child usage, if still registered.
    pub fn child_usage(&self, input_file: &InputFile) -> Option<ChildUsage> {
        self.usage.get(input_file).copied()
    }

    /// Host-wide CPU/memory/disk snapshot (spec.md §4.2). Does not respect
    /// the debounce window — callers that need a fresh read on demand (e.g.
    /// the calibrator) can call this directly; the main loop instead drives
    /// everything through [`refresh`](Self::refresh).
    pub fn host_snapshot(&mut self) -> ResourceSnapshot {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();
        self.disks.refresh(true);

        let cpu_percent = self.sys.global_cpu_usage() as f64;
        let total_mem = self.sys.total_memory();
        let used_mem = self.sys.used_memory();
        let memory_percent = if total_mem == 0 {
            0.0
        } else {
            (used_mem as f64 / total_mem as f64) * 100.0
        };
        let disk_percent = self.disk_percent_for_output_dir();

        ResourceSnapshot {
            cpu_percent,
            memory_percent,
            disk_percent,
        }
    }

    /// Refresh per-child counters for every registered pid, dropping any pid
    /// that has vanished. This is a no-op if called within
    /// `monitoring_interval` of the previous execution (spec.md §4.2 rate
    /// control). Returns `Some(snapshot)` when a fresh sample was actually
    /// taken, `None` when debounced.
    pub fn refresh(&mut self) -> Option<ResourceSnapshot> {
        let now = Instant::now();
        if let Some(last) = self.last_refresh {
            if now.duration_since(last) < self.monitoring_interval {
                return None;
            }
        }
        self.last_refresh = Some(now);

        let snapshot = self.host_snapshot();

        let pids: Vec<Pid> = self
            .registered
            .values()
            .map(|pid| Pid::from_u32(*pid))
            .collect();
        if !pids.is_empty() {
            self.sys
                .refresh_processes(ProcessesToUpdate::Some(&pids), true);
        }

        let mut vanished = Vec::new();
        for (input_file, pid) in self.registered.iter() {
            match self.sys.process(Pid::from_u32(*pid)) {
                Some(process) => {
                    self.usage.insert(
                        input_file.clone(),
                        ChildUsage {
                            cpu_percent: process.cpu_usage() as f64,
                            rss_bytes: process.memory(),
                        },
                    );
                }
                None => vanished.push(input_file.clone()),
            }
        }
        for input_file in vanished {
            debug!(input = %input_file, "sampler: pid vanished, dropping registration");
            self.registered.remove(&input_file);
            self.usage.remove(&input_file);
        }

        Some(snapshot)
    }

    fn disk_percent_for_output_dir(&self) -> f64 {
        let mut best: Option<(&std::path::Path, &sysinfo::Disk)> = None;
        for disk in self.disks.list() {
            let mount = disk.mount_point();
            if self.output_dir.starts_with(mount) {
                match best {
                    Some((current_mount, _)) if current_mount.as_os_str().len() >= mount.as_os_str().len() => {}
                    _ => best = Some((mount, disk)),
                }
            }
        }
        match best {
            Some((_, disk)) => {
                let total = disk.total_space();
                let available = disk.available_space();
                if total == 0 {
                    0.0
                } else {
                    let used = total.saturating_sub(available);
                    (used as f64 / total as f64) * 100.0
                }
            }
            None => 0.0,
        }
    }
}
