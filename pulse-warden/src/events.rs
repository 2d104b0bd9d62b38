#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

/* Structured events emitted by the warden components */

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::ZombieAbort;
use crate::flood::Rejection;
use crate::work::{InterruptError, Work};
use crate::zombie::ScanReport;

/// Something worth logging happened
#[derive(Debug)]
pub enum Event<'a> {
    /// Admission refused on a saturated dimension
    Rejected {
        /// Work that was refused
        work: &'a Work,
        /// Dimension and wait hint
        rejection: &'a Rejection,
    },
    /// Work running longer than the watch threshold
    LongRunning {
        /// The work
        work: &'a Work,
    },
    /// Work running longer than its maximum time
    Zombie {
        /// The work
        work: &'a Work,
    },
    /// Termination requested for a zombie
    Killed {
        /// The work
        work: &'a Work,
    },
    /// Termination request could not be issued
    KillFailed {
        /// The work
        work: &'a Work,
        /// Why the request failed
        error: &'a InterruptError,
    },
    /// Delegated task began running
    TaskStarted {
        /// The child work
        work: &'a Work,
        /// Logging fields installed for the task
        fields: &'a BTreeMap<String, String>,
    },
    /// Delegated task finished, normally or not
    TaskFinished {
        /// The child work
        work: &'a Work,
        /// Time spent running
        elapsed: Duration,
        /// False on panic or cancellation
        success: bool,
    },
    /// Zombie abort reached a boundary
    Aborted {
        /// The abort signal
        abort: &'a ZombieAbort,
    },
    /// A zombie scan finished
    ScanCompleted {
        /// Scan totals
        report: &'a ScanReport,
    },
}

/// Receiver of warden events
pub trait EventSink: Send + Sync {
    /// Handles one event. Must not block.
    fn on_event(&self, event: &Event<'_>);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    #[inline(always)]
    fn on_event(&self, _event: &Event<'_>) {
        // No-op
    }
}

/// Fan-out to several sinks, in order
#[derive(Default, Clone)]
pub struct TeeSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl TeeSink {
    /// Empty fan-out
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a downstream sink
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of downstream sinks
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True without downstream sinks
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for TeeSink {
    fn on_event(&self, event: &Event<'_>) {
        for sink in &self.sinks {
            sink.on_event(event);
        }
    }
}

/// Sink that forwards events to `tracing`
#[cfg(feature = "tracing")]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[cfg(feature = "tracing")]
impl EventSink for TracingSink {
    #[allow(clippy::cast_possible_truncation)]
    fn on_event(&self, event: &Event<'_>) {
        match event {
            Event::Rejected { work, rejection } => tracing::warn!(
                request_id = work.id(),
                root_id = work.root_id(),
                dimension = %rejection.limit,
                retry_after_secs = rejection.retry_after.as_secs(),
                "{}",
                rejection.message
            ),
            Event::LongRunning { work } => tracing::info!(
                request_id = work.id(),
                root_id = work.root_id(),
                kind = %work.kind(),
                name = work.name(),
                elapsed_ms = work.elapsed_millis(),
                max_time_ms = work.max_time().as_millis() as u64,
                "Long-running work"
            ),
            Event::Zombie { work } => tracing::warn!(
                request_id = work.id(),
                root_id = work.root_id(),
                kind = %work.kind(),
                name = work.name(),
                elapsed_ms = work.elapsed_millis(),
                max_time_ms = work.max_time().as_millis() as u64,
                "Zombie work detected"
            ),
            Event::Killed { work } => tracing::warn!(
                request_id = work.id(),
                elapsed_ms = work.elapsed_millis(),
                "Termination requested for zombie work"
            ),
            Event::KillFailed { work, error } => tracing::warn!(
                request_id = work.id(),
                error = %error,
                "Failed to request termination of zombie work"
            ),
            Event::TaskStarted { work, fields } => tracing::debug!(
                request_id = work.id(),
                root_id = work.root_id(),
                task = work.name(),
                fields = ?fields,
                "Task started"
            ),
            Event::TaskFinished {
                work,
                elapsed,
                success,
            } => tracing::info!(
                request_id = work.id(),
                root_id = work.root_id(),
                task = work.name(),
                elapsed_ms = elapsed.as_millis() as u64,
                success = *success,
                "Task finished"
            ),
            Event::Aborted { abort } => tracing::error!(
                request_id = %abort.id,
                root_id = %abort.root_id,
                elapsed_ms = abort.elapsed.as_millis() as u64,
                max_time_ms = abort.max_time.as_millis() as u64,
                "Zombie work aborted"
            ),
            Event::ScanCompleted { report } => tracing::debug!(
                inspected = report.inspected,
                long_running = report.long_running,
                zombies = report.zombies,
                kills = report.kills,
                kill_failures = report.kill_failures,
                "Zombie scan completed"
            ),
        }
    }
}

/// Sink used by components built without one
///
/// `TracingSink` when the `tracing` feature is on, `NullSink` otherwise.
#[must_use]
pub fn default_sink() -> Arc<dyn EventSink> {
    #[cfg(feature = "tracing")]
    {
        Arc::new(TracingSink)
    }

    #[cfg(not(feature = "tracing"))]
    {
        Arc::new(NullSink)
    }
}
