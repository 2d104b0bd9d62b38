//! In-process admission control and liveness tracking for Tokio services
//!
//! The crate tracks every running unit of work in an outstanding-work
//! registry and builds three consumers on top of it: a flood sensor that
//! refuses work when a concurrency dimension is saturated, a zombie detector
//! that finds and cancels work running past its allowance, and a decorator
//! that carries a request's identity into the tasks it delegates.
//!
//! ```rust
//! use pulse_warden::flood::Admission;
//! use pulse_warden::work::{Work, WorkKind};
//! use pulse_warden::{Warden, WardenConfig};
//!
//! let warden = Warden::from_config(WardenConfig::default()).unwrap();
//!
//! let work = Work::builder("req-1")
//!     .kind(WorkKind::Request)
//!     .session("s-1")
//!     .build();
//! let _ticket = warden.registry().create(work.clone());
//!
//! match warden.sensor().may_proceed(Some(&work)) {
//!     Admission::Proceed => { /* handle the request */ }
//!     Admission::RetryLater(rejection) => println!("429, retry in {:?}", rejection.retry_after),
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Admission control and liveness tracking
/// Time sources
pub mod clock;
/// Warden configuration and presets
pub mod config;
/// Per-execution-context frames
pub mod context;
/// Error types
pub mod error;
/// Structured events and sinks
pub mod events;
/// Flood sensor and connection limits
pub mod flood;
/// Work identifier generation
pub mod ids;
/// Activity counters
pub mod metrics;
/// Context propagation for delegated work
pub mod propagate;
/// Outstanding-work registry
pub mod registry;
/// Components wired from configuration
pub mod warden;
/// Units of tracked work
pub mod work;
/// Zombie detector
pub mod zombie;

// Public API exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{LimitProfile, WardenConfig, WorkConfig};
pub use context::{Frame, SharedFrame};
pub use error::{WardenError, WardenResult, ZombieAbort};
pub use events::{Event, EventSink, NullSink, TeeSink};
#[cfg(feature = "tracing")]
pub use events::TracingSink;
pub use flood::{Admission, ConnectionLimit, ConnectionLimits, FloodConfig, FloodSensor, Rejection};
pub use ids::{IdGenerator, SequentialIds, UuidGenerator};
pub use metrics::{MetricsSnapshot, WardenMetrics};
pub use propagate::{Decorated, Decorator};
pub use registry::{Filtered, Outstanding, Ticket, WorkRegistry};
pub use warden::Warden;
pub use work::{Interrupt, InterruptError, Outcome, Work, WorkBuilder, WorkKind};
pub use zombie::{ScanReport, ZombieConfig, ZombieDetector, kill_runaway};
