#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Monotonic clock abstraction
//!
//! Work items read their start time and elapsed time through a [`Clock`]
//! so tests can freeze and advance time deterministically.
//!
//! # Example
//!
//! ```rust
//! use pulse_warden::clock::{Clock, ManualClock};
//! use std::time::Duration;
//!
//! let clock = ManualClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_millis(250));
//! assert_eq!(clock.now() - start, Duration::from_millis(250));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic time
///
/// `now()` is an offset from an arbitrary, clock-specific origin. Only
/// differences between two readings of the same clock are meaningful.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current reading. Never decreases.
    fn now(&self) -> Duration;

    /// Name of the implementation, for diagnostics
    fn name(&self) -> &'static str;
}

/// Wall clock backed by `std::time::Instant`
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose origin is the moment of construction
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn name(&self) -> &'static str {
        "monotonic"
    }
}

/// Manually driven clock for deterministic tests
///
/// Time stands still until [`ManualClock::advance`] or [`ManualClock::set`]
/// is called. `set` refuses to move backwards.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Creates a frozen clock reading zero
    #[must_use]
    pub fn new() -> Self {
        Self {
            nanos: AtomicU64::new(0),
        }
    }

    /// Creates a frozen clock already wrapped for sharing
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Moves time forward by `delta`
    pub fn advance(&self, delta: Duration) {
        self.nanos.fetch_add(to_nanos(delta), Ordering::AcqRel);
    }

    /// Jumps to `at` if it is not earlier than the current reading
    pub fn set(&self, at: Duration) {
        self.nanos.fetch_max(to_nanos(at), Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// Returns the process-wide default clock
///
/// All work created without an explicit clock shares this instance, so their
/// readings are comparable.
#[must_use]
pub fn system_clock() -> Arc<dyn Clock> {
    static SYSTEM: std::sync::OnceLock<Arc<MonotonicClock>> = std::sync::OnceLock::new();
    SYSTEM.get_or_init(|| Arc::new(MonotonicClock::new())).clone()
}

#[allow(clippy::cast_possible_truncation)]
fn to_nanos(d: Duration) -> u64 {
    d.as_nanos().min(u128::from(u64::MAX)) as u64
}
