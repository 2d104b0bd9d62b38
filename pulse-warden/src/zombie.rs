//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Zombie detector: periodic reaper for stuck work
//!
//! One dedicated thread sweeps a registry on a fixed period. Work past the
//! watch threshold is reported; work past its own maximum time is reported as
//! a zombie and asked to stop through [`Work::interrupt`]. The detector never
//! removes registry entries: they leave when their tickets close.
//!
//! Killing is cooperative. Code honours it by selecting on the work's
//! cancellation token or by calling [`kill_runaway`] at checkpoints.

#![forbid(unsafe_code)]

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::context;
use crate::error::{WardenError, WardenResult, ZombieAbort};
use crate::events::{Event, EventSink, default_sink};
use crate::registry::WorkRegistry;
use crate::work::Work;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info};

/// Zombie detector configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieConfig {
    /// Time between sweeps
    pub period_ms: u64,
    /// Elapsed time above which work is reported as long-running
    pub watch_ms: u64,
    /// Name of the sweeping thread
    pub thread_name: String,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            period_ms: 30_000,
            watch_ms: 30_000,
            thread_name: "pulse-warden-zombies".to_string(),
        }
    }
}

impl ZombieConfig {
    /// Sweep period
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Long-running threshold
    pub fn watch(&self) -> Duration {
        Duration::from_millis(self.watch_ms)
    }
}

/// Totals of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Work items looked at
    pub inspected: usize,
    /// Items past the watch threshold but within their maximum time
    pub long_running: usize,
    /// Items past their maximum time
    pub zombies: usize,
    /// Termination requests issued
    pub kills: usize,
    /// Termination requests that could not be issued
    pub kill_failures: usize,
}

struct Running {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// Periodic sweeper over a work registry
///
/// # Examples
///
/// ```rust
/// use pulse_warden::registry::Outstanding;
/// use pulse_warden::zombie::{ZombieConfig, ZombieDetector};
///
/// let registry = Outstanding::new();
/// let detector = ZombieDetector::new(registry.clone(), ZombieConfig::default());
/// detector.start().unwrap();
/// assert!(detector.is_running());
/// detector.close();
/// ```
pub struct ZombieDetector {
    registry: Arc<dyn WorkRegistry>,
    config: ZombieConfig,
    sink: Arc<dyn EventSink>,
    running: Mutex<Option<Running>>,
}

impl ZombieDetector {
    /// Creates a stopped detector over `registry`
    pub fn new(registry: impl WorkRegistry + 'static, config: ZombieConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config,
            sink: default_sink(),
            running: Mutex::new(None),
        }
    }

    /// Replaces the event sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Detector configuration
    pub fn config(&self) -> &ZombieConfig {
        &self.config
    }

    /// True between [`start`](Self::start) and [`close`](Self::close)
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Starts sweeping every period on a dedicated thread
    ///
    /// Starting a running detector does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidConfig`] for a zero period and
    /// [`WardenError::DetectorSpawn`] if the thread cannot be created.
    pub fn start(&self) -> WardenResult<()> {
        if self.config.period_ms == 0 {
            return Err(WardenError::InvalidConfig("zombie.period_ms must be positive".to_string()));
        }

        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let registry = Arc::clone(&self.registry);
        let sink = Arc::clone(&self.sink);
        let period = self.config.period();
        let watch = self.config.watch();
        let thread_name = self.config.thread_name.clone();

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                #[cfg(feature = "tracing")]
                info!(thread_name = %thread_name, period_ms = period.as_millis() as u64, "Zombie detector started");

                loop {
                    match shutdown_rx.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                                sweep(registry.as_ref(), watch, sink.as_ref())
                            }));
                            if outcome.is_err() {
                                #[cfg(feature = "tracing")]
                                error!(thread_name = %thread_name, "Zombie scan panicked");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                #[cfg(feature = "tracing")]
                info!(thread_name = %thread_name, "Zombie detector stopped");
            })
            .map_err(WardenError::DetectorSpawn)?;

        *running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Sweeps the registry once on the calling thread
    pub fn scan(&self) -> ScanReport {
        sweep(self.registry.as_ref(), self.config.watch(), self.sink.as_ref())
    }

    /// Stops the schedule and waits for the sweeping thread
    ///
    /// Idempotent; closing a detector that never started does nothing.
    pub fn close(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        // Wakes the thread at once; a full channel means a stop is pending
        let _ = running.shutdown.try_send(());
        drop(running.shutdown);

        if running.handle.join().is_err() {
            #[cfg(feature = "tracing")]
            error!("Zombie detector thread panicked");
        }
    }

    /// Aborts if the calling context's work in this registry is a zombie
    ///
    /// # Errors
    ///
    /// Returns [`ZombieAbort`] when that work is past its maximum time or has
    /// already been killed.
    pub fn kill_runaway(&self) -> Result<(), ZombieAbort> {
        check(self.registry.current().as_deref())
    }
}

impl Drop for ZombieDetector {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ZombieDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZombieDetector")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Aborts if the calling context's innermost work is a zombie
///
/// Looks at the innermost work of the calling frame, whatever registry it
/// was opened on. Meant for checkpoints inside expensive computations:
///
/// ```rust
/// use pulse_warden::ZombieAbort;
///
/// fn crunch(rows: &[u64]) -> Result<u64, ZombieAbort> {
///     let mut total = 0;
///     for row in rows {
///         pulse_warden::kill_runaway()?;
///         total += row;
///     }
///     Ok(total)
/// }
///
/// assert_eq!(crunch(&[1, 2, 3]), Ok(6));
/// ```
///
/// # Errors
///
/// Returns [`ZombieAbort`] when that work is past its maximum time or has
/// already been killed.
pub fn kill_runaway() -> Result<(), ZombieAbort> {
    check(context::innermost().as_deref())
}

fn check(work: Option<&Work>) -> Result<(), ZombieAbort> {
    match work {
        Some(work) if work.is_zombie() || work.is_killed() => Err(ZombieAbort::of(work)),
        _ => Ok(()),
    }
}

fn sweep(registry: &dyn WorkRegistry, watch: Duration, sink: &dyn EventSink) -> ScanReport {
    let mut report = ScanReport::default();

    for work in registry.stream() {
        report.inspected += 1;

        if work.is_zombie() {
            report.zombies += 1;
            sink.on_event(&Event::Zombie { work: &work });

            match work.interrupt() {
                Ok(()) => {
                    report.kills += 1;
                    sink.on_event(&Event::Killed { work: &work });
                }
                Err(error) => {
                    report.kill_failures += 1;
                    sink.on_event(&Event::KillFailed {
                        work: &work,
                        error: &error,
                    });
                }
            }
        } else if work.elapsed() > watch {
            report.long_running += 1;
            sink.on_event(&Event::LongRunning { work: &work });
        }
    }

    #[cfg(feature = "tracing")]
    debug!(inspected = report.inspected, "Zombie sweep finished");

    sink.on_event(&Event::ScanCompleted { report: &report });
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::context::Frame;
    use crate::events::NullSink;
    use crate::registry::Outstanding;

    fn detector(registry: &Outstanding) -> ZombieDetector {
        ZombieDetector::new(registry.clone(), ZombieConfig::default()).with_sink(Arc::new(NullSink))
    }

    #[test]
    fn test_scan_classifies_work() {
        let clock = ManualClock::shared();
        let registry = Outstanding::new();
        let build = |id: &str, max: u64| {
            Work::builder(id)
                .clock(clock.clone() as Arc<dyn Clock>)
                .max_time(Duration::from_secs(max))
                .build()
        };

        let _zombie = registry.create(build("zombie", 10));
        let _slow = registry.create(build("slow", 3600));
        clock.advance(Duration::from_secs(40));
        let _fresh = registry.create(build("fresh", 10));

        let report = detector(&registry).scan();
        assert_eq!(
            report,
            ScanReport {
                inspected: 3,
                long_running: 1,
                zombies: 1,
                kills: 1,
                kill_failures: 0,
            }
        );
    }

    #[test]
    fn test_scan_never_removes_entries() {
        let clock = ManualClock::shared();
        let registry = Outstanding::new();
        let work = Work::builder("w")
            .clock(clock.clone() as Arc<dyn Clock>)
            .max_time(Duration::from_millis(5))
            .build();
        let _ticket = registry.create(work.clone());
        clock.advance(Duration::from_millis(6));

        detector(&registry).scan();
        assert!(work.is_killed());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_start_close_idempotent() {
        let registry = Outstanding::new();
        let detector = detector(&registry);
        detector.close();
        detector.start().unwrap();
        detector.start().unwrap();
        assert!(detector.is_running());
        detector.close();
        detector.close();
        assert!(!detector.is_running());
    }

    #[test]
    fn test_zero_period_is_refused() {
        let config = ZombieConfig {
            period_ms: 0,
            ..ZombieConfig::default()
        };
        let detector = ZombieDetector::new(Outstanding::new(), config);
        assert!(matches!(detector.start(), Err(WardenError::InvalidConfig(msg)) if msg.contains("period_ms")));
        assert!(!detector.is_running());
        // Sweeping on demand still works
        assert_eq!(detector.scan().inspected, 0);
    }

    #[test]
    fn test_kill_runaway_checks_current_work() {
        let clock = ManualClock::shared();
        let registry = Outstanding::new();
        let detector = detector(&registry);

        context::sync_scope(Frame::new(), || {
            assert_eq!(detector.kill_runaway(), Ok(()));

            let work = Work::builder("w")
                .clock(clock.clone() as Arc<dyn Clock>)
                .max_time(Duration::from_millis(100))
                .build();
            let _ticket = registry.create(work);
            assert_eq!(detector.kill_runaway(), Ok(()));

            clock.advance(Duration::from_millis(101));
            let abort = detector.kill_runaway().unwrap_err();
            assert_eq!(abort.id, "w");
            assert_eq!(kill_runaway().unwrap_err(), abort);
        });
    }

    #[test]
    fn test_killed_work_aborts_before_max_time() {
        let registry = Outstanding::new();
        context::sync_scope(Frame::new(), || {
            let work = Work::builder("w").build();
            let _ticket = registry.create(work.clone());
            work.cancellation().cancel();
            assert!(kill_runaway().is_err());
        });
    }
}
