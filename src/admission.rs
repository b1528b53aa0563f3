//! Admission Controller (spec.md §4.3): decides whether a new child may
//! start now, and owns the dynamic throttling state machine.

use tracing::info;

use crate::schema::{JobSpec, ResourceSnapshot, ThrottleState};

pub const DEFAULT_THROTTLE_THRESHOLD: f64 = 0.9;
pub const DEFAULT_RECOVERY_THRESHOLD: f64 = 0.7;

pub struct AdmissionController {
    throttle: ThrottleState,
    throttle_threshold: f64,
    recovery_threshold: f64,
}

impl AdmissionController {
    pub fn new(max_processes_cap: usize) -> Self {
        AdmissionController {
            throttle: ThrottleState::new(max_processes_cap),
            throttle_threshold: DEFAULT_THROTTLE_THRESHOLD,
            recovery_threshold: DEFAULT_RECOVERY_THRESHOLD,
        }
    }

    #[cfg(test)]
    pub fn with_thresholds(
        max_processes_cap: usize,
        throttle_threshold: f64,
        recovery_threshold: f64,
    ) -> Self {
        AdmissionController {
            throttle: ThrottleState::new(max_processes_cap),
            throttle_threshold,
            recovery_threshold,
        }
    }

    pub fn effective_max_processes(&self) -> usize {
        self.throttle.effective_max_processes
    }

    pub fn is_throttled(&self) -> bool {
        self.throttle.throttled
    }

    /// Raise the cap at startup if the calibrator proposed a (lower or
    /// higher) ceiling. Only called once, before any child has started.
    pub fn apply_calibrated_cap(&mut self, max_processes: usize) {
        self.throttle.original_max_processes = max_processes;
        self.throttle.effective_max_processes = max_processes;
    }

    /// spec.md §4.3 operation 1: may a new child be admitted right now?
    pub fn may_start(&self, active_children: usize, snapshot: ResourceSnapshot, spec: &JobSpec) -> bool {
        if active_children >= self.throttle.effective_max_processes {
            return false;
        }
        snapshot.cpu_percent < spec.cpu_percent_max
            && snapshot.memory_percent < spec.memory_percent_max
            && snapshot.disk_percent < spec.disk_percent_max
    }

    /// spec.md §4.3 dynamic throttling: evaluated on every fresh snapshot.
    pub fn observe(&mut self, active_children: usize, snapshot: ResourceSnapshot, spec: &JobSpec) {
        let pressure = snapshot.pressure(spec);

        if !self.throttle.throttled && pressure > self.throttle_threshold {
            let min_ratio = snapshot.min_ratio(spec);
            let new_cap = ((active_children as f64) * min_ratio * 0.8).floor() as i64;
            let new_cap = new_cap.max(1) as usize;
            self.throttle.throttled = true;
            self.throttle.effective_max_processes = new_cap;
            info!(
                pressure,
                new_cap, active_children, "throttle activated"
            );
        } else if self.throttle.throttled && pressure < self.recovery_threshold {
            self.throttle.throttled = false;
            self.throttle.effective_max_processes = self.throttle.original_max_processes;
            info!(
                pressure,
                restored_cap = self.throttle.effective_max_processes,
                "throttle recovered"
            );
        }
    }
}
