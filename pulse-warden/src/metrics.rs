//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Counters for admission, liveness and delegated-task activity
//!
//! [`WardenMetrics`] is an [`EventSink`]: tee it next to the tracing sink to
//! count what the components report. With the `metrics` feature every
//! increment is also forwarded to the `metrics` facade under `pulse_warden_*`
//! names.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[cfg(feature = "metrics")]
use metrics::counter;

use crate::events::{Event, EventSink};

/// Warden activity counters
#[derive(Debug)]
pub struct WardenMetrics {
    /// Work admitted by the flood sensor
    pub admitted: AtomicU64,

    /// Work refused by the flood sensor
    pub rejected: AtomicU64,

    /// Long-running reports
    pub long_running: AtomicU64,

    /// Zombie reports
    pub zombies: AtomicU64,

    /// Termination requests issued
    pub kills: AtomicU64,

    /// Termination requests that failed
    pub kill_failures: AtomicU64,

    /// Delegated tasks started
    pub tasks_started: AtomicU64,

    /// Delegated tasks finished successfully
    pub tasks_finished: AtomicU64,

    /// Delegated tasks that panicked or were dropped
    pub tasks_failed: AtomicU64,

    /// Zombie aborts reaching a boundary
    pub aborts: AtomicU64,

    /// Completed zombie sweeps
    pub scans: AtomicU64,

    start_time: Instant,
}

impl WardenMetrics {
    /// All counters at zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            long_running: AtomicU64::new(0),
            zombies: AtomicU64::new(0),
            kills: AtomicU64::new(0),
            kill_failures: AtomicU64::new(0),
            tasks_started: AtomicU64::new(0),
            tasks_finished: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Records an admitted unit of work
    ///
    /// Admission is not an event, so boundaries call this directly.
    pub fn record_admitted(&self) {
        self.admitted.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_warden_admitted_total").increment(1);
    }

    fn record_rejected(&self, dimension: &str) {
        self.rejected.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!("pulse_warden_rejected_total", "dimension" => dimension.to_string()).increment(1);

        #[cfg(not(feature = "metrics"))]
        let _ = dimension;
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        counter!(name).increment(1);

        #[cfg(not(feature = "metrics"))]
        let _ = name;
    }

    /// Consistent-enough copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            long_running: self.long_running.load(Ordering::Relaxed),
            zombies: self.zombies.load(Ordering::Relaxed),
            kills: self.kills.load(Ordering::Relaxed),
            kill_failures: self.kill_failures.load(Ordering::Relaxed),
            tasks_started: self.tasks_started.load(Ordering::Relaxed),
            tasks_finished: self.tasks_finished.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            scans: self.scans.load(Ordering::Relaxed),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    /// Zeroes every counter
    pub fn reset(&self) {
        for counter in [
            &self.admitted,
            &self.rejected,
            &self.long_running,
            &self.zombies,
            &self.kills,
            &self.kill_failures,
            &self.tasks_started,
            &self.tasks_finished,
            &self.tasks_failed,
            &self.aborts,
            &self.scans,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for WardenMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for WardenMetrics {
    fn on_event(&self, event: &Event<'_>) {
        match event {
            Event::Rejected { rejection, .. } => self.record_rejected(&rejection.limit),
            Event::LongRunning { .. } => Self::bump(&self.long_running, "pulse_warden_long_running_total"),
            Event::Zombie { .. } => Self::bump(&self.zombies, "pulse_warden_zombies_total"),
            Event::Killed { .. } => Self::bump(&self.kills, "pulse_warden_kills_total"),
            Event::KillFailed { .. } => Self::bump(&self.kill_failures, "pulse_warden_kill_failures_total"),
            Event::TaskStarted { .. } => Self::bump(&self.tasks_started, "pulse_warden_tasks_started_total"),
            Event::TaskFinished { success: true, .. } => {
                Self::bump(&self.tasks_finished, "pulse_warden_tasks_finished_total");
            }
            Event::TaskFinished { success: false, .. } => {
                Self::bump(&self.tasks_failed, "pulse_warden_tasks_failed_total");
            }
            Event::Aborted { .. } => Self::bump(&self.aborts, "pulse_warden_aborts_total"),
            Event::ScanCompleted { .. } => Self::bump(&self.scans, "pulse_warden_scans_total"),
        }
    }
}

/// Point-in-time copy of [`WardenMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Work admitted
    pub admitted: u64,
    /// Work refused
    pub rejected: u64,
    /// Long-running reports
    pub long_running: u64,
    /// Zombie reports
    pub zombies: u64,
    /// Termination requests issued
    pub kills: u64,
    /// Termination requests that failed
    pub kill_failures: u64,
    /// Delegated tasks started
    pub tasks_started: u64,
    /// Delegated tasks finished successfully
    pub tasks_finished: u64,
    /// Delegated tasks that failed
    pub tasks_failed: u64,
    /// Zombie aborts
    pub aborts: u64,
    /// Completed sweeps
    pub scans: u64,
    /// Seconds since the counters were created
    pub uptime_secs: u64,
}

impl MetricsSnapshot {
    /// Share of admission decisions that were refusals
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        let decided = self.admitted + self.rejected;
        if decided == 0 {
            0.0
        } else {
            self.rejected as f64 / decided as f64
        }
    }
}
