#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Units of tracked work
//!
//! A [`Work`] describes one request or background task: who it belongs to,
//! when it started, how long it may run, and how to ask it to stop.
//! Work is shared as `Arc<Work>` between the registry, the flood sensor and
//! the zombie detector; everything mutable inside it is interior and
//! thread-safe.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, system_clock};
use crate::error::{WardenError, WardenResult};

/// Default maximum duration of a unit of work
pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(5 * 60);

const OUTCOME_UNSET: u8 = 0;
const OUTCOME_SUCCESS: u8 = 1;
const OUTCOME_FAILURE: u8 = 2;

/// Runtime classification of work, used by filtered registry views
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    /// Inbound request (HTTP or RPC)
    Request,
    /// Background or delegated task
    Task,
    /// Application-defined kind
    Custom(&'static str),
}

impl fmt::Display for WorkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Task => f.write_str("task"),
            Self::Custom(name) => f.write_str(name),
        }
    }
}

/// Final outcome of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Completed successfully
    Success,
    /// Failed, panicked or was cancelled
    Failure,
}

/// Errors raised when a cancellation request cannot be issued
#[derive(Debug, thiserror::Error)]
pub enum InterruptError {
    /// The owning context refused the request
    #[error("Interrupt refused: {0}")]
    Refused(String),

    /// The owning context no longer exists
    #[error("Owning execution context is gone")]
    Gone,
}

/// Handle able to request termination of an execution context
///
/// Requests are asynchronous: returning `Ok` only means the request was
/// delivered, not that the context stopped.
pub trait Interrupt: Send + Sync {
    /// Requests termination of the owning context
    fn interrupt(&self) -> Result<(), InterruptError>;
}

impl Interrupt for CancellationToken {
    fn interrupt(&self) -> Result<(), InterruptError> {
        self.cancel();
        Ok(())
    }
}

impl Interrupt for tokio::task::AbortHandle {
    fn interrupt(&self) -> Result<(), InterruptError> {
        if self.is_finished() {
            return Err(InterruptError::Gone);
        }
        self.abort();
        Ok(())
    }
}

/// One tracked unit of execution
pub struct Work {
    id: String,
    root_id: String,
    kind: WorkKind,
    name: Option<String>,
    session: Option<String>,
    user: Option<String>,
    service: Option<String>,
    clock: Arc<dyn Clock>,
    started: Duration,
    max_time: Duration,
    token: CancellationToken,
    owner: Option<Arc<dyn Interrupt>>,
    checked: Mutex<HashSet<String>>,
    metadata: Mutex<BTreeMap<String, String>>,
    outcome: AtomicU8,
}

impl Work {
    /// Starts building work with the given identifier
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pulse_warden::work::{Work, WorkKind};
    /// use std::time::Duration;
    ///
    /// let work = Work::builder("req-42")
    ///     .kind(WorkKind::Request)
    ///     .session("s-1")
    ///     .max_time(Duration::from_secs(30))
    ///     .build();
    /// assert_eq!(work.session(), Some("s-1"));
    /// assert!(!work.is_zombie());
    /// ```
    pub fn builder(id: impl Into<String>) -> WorkBuilder {
        WorkBuilder::new(id.into())
    }

    /// Unique identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier of the top-level request this work belongs to
    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Runtime classification
    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    /// Route or task label
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Session key
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Remote user key
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Logical service key
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Maximum allowed duration
    pub fn max_time(&self) -> Duration {
        self.max_time
    }

    /// Start reading of the work's clock
    pub fn started(&self) -> Duration {
        self.started
    }

    /// Time since the work started
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_sub(self.started)
    }

    /// Time since the work started, in whole milliseconds
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn elapsed_millis(&self) -> u64 {
        self.elapsed().as_millis() as u64
    }

    /// True once the work has run strictly longer than `max_time`
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub fn is_zombie(&self) -> bool {
        self.elapsed_millis() > self.max_time.as_millis() as u64
    }

    /// Token cancelled when the work is killed
    ///
    /// Long-running code can select on `cancellation().cancelled()` or poll
    /// `is_cancelled()` to honour kill requests.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// True once a kill has been requested
    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Requests termination of the owning execution context
    ///
    /// Always cancels the work's own token; if an owner handle was attached
    /// it is interrupted too and its failure is reported.
    pub fn interrupt(&self) -> Result<(), InterruptError> {
        self.token.cancel();
        match &self.owner {
            Some(owner) => owner.interrupt(),
            None => Ok(()),
        }
    }

    /// Records that `dimension` has been evaluated for this work
    ///
    /// Returns `false` if it was already recorded.
    pub fn mark_checked(&self, dimension: &str) -> bool {
        let mut checked = self.checked.lock();
        if checked.contains(dimension) {
            return false;
        }
        checked.insert(dimension.to_string())
    }

    /// True if `dimension` has been evaluated for this work
    pub fn is_checked(&self, dimension: &str) -> bool {
        self.checked.lock().contains(dimension)
    }

    /// Adds a metadata pair after validating the key
    ///
    /// # Errors
    ///
    /// Fails with [`WardenError::MissingContextKey`] or
    /// [`WardenError::InvalidContextKey`] when the key is not snake_case.
    pub fn put(&self, key: &str, value: impl Into<String>) -> WardenResult<()> {
        validate_key(key)?;
        self.metadata.lock().insert(key.to_string(), value.into());
        Ok(())
    }

    /// Value of a metadata key
    pub fn get(&self, key: &str) -> Option<String> {
        self.metadata.lock().get(key).cloned()
    }

    /// Copy of all metadata
    pub fn metadata(&self) -> BTreeMap<String, String> {
        self.metadata.lock().clone()
    }

    /// Sets the outcome; only the first call has an effect
    ///
    /// Returns `true` if this call set it.
    pub fn set_success(&self, success: bool) -> bool {
        let value = if success { OUTCOME_SUCCESS } else { OUTCOME_FAILURE };
        self.outcome
            .compare_exchange(OUTCOME_UNSET, value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Outcome, if set
    pub fn outcome(&self) -> Option<Outcome> {
        match self.outcome.load(Ordering::Acquire) {
            OUTCOME_SUCCESS => Some(Outcome::Success),
            OUTCOME_FAILURE => Some(Outcome::Failure),
            _ => None,
        }
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("id", &self.id)
            .field("root_id", &self.root_id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("session", &self.session)
            .field("user", &self.user)
            .field("service", &self.service)
            .field("elapsed", &self.elapsed())
            .field("max_time", &self.max_time)
            .field("killed", &self.is_killed())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Work`]
#[must_use]
pub struct WorkBuilder {
    id: String,
    root_id: Option<String>,
    kind: WorkKind,
    name: Option<String>,
    session: Option<String>,
    user: Option<String>,
    service: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    max_time: Duration,
    token: Option<CancellationToken>,
    owner: Option<Arc<dyn Interrupt>>,
    metadata: BTreeMap<String, String>,
}

impl WorkBuilder {
    fn new(id: String) -> Self {
        Self {
            id,
            root_id: None,
            kind: WorkKind::Request,
            name: None,
            session: None,
            user: None,
            service: None,
            clock: None,
            max_time: DEFAULT_MAX_TIME,
            token: None,
            owner: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Top-level request identifier (defaults to the work's own id)
    pub fn root_id(mut self, root_id: impl Into<String>) -> Self {
        self.root_id = Some(root_id.into());
        self
    }

    /// Runtime classification (default: `Request`)
    pub fn kind(mut self, kind: WorkKind) -> Self {
        self.kind = kind;
        self
    }

    /// Route or task label
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Session key
    pub fn session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Remote user key
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Logical service key
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Maximum allowed duration (default: five minutes)
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = max_time;
        self
    }

    /// Clock used for start and elapsed time (default: the system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Cancellation token to use instead of a fresh one
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Extra handle interrupted when the work is killed
    pub fn owner(mut self, owner: Arc<dyn Interrupt>) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Initial metadata pair
    ///
    /// # Errors
    ///
    /// Fails when the key is not snake_case.
    pub fn metadata(mut self, key: &str, value: impl Into<String>) -> WardenResult<Self> {
        validate_key(key)?;
        self.metadata.insert(key.to_string(), value.into());
        Ok(self)
    }

    /// Finishes the work, reading its start time from the clock now
    #[must_use]
    pub fn build(self) -> Arc<Work> {
        let clock = self.clock.unwrap_or_else(system_clock);
        let started = clock.now();
        let root_id = self.root_id.unwrap_or_else(|| self.id.clone());

        Arc::new(Work {
            id: self.id,
            root_id,
            kind: self.kind,
            name: self.name,
            session: self.session,
            user: self.user,
            service: self.service,
            clock,
            started,
            max_time: self.max_time,
            token: self.token.unwrap_or_default(),
            owner: self.owner,
            checked: Mutex::new(HashSet::new()),
            metadata: Mutex::new(self.metadata),
            outcome: AtomicU8::new(OUTCOME_UNSET),
        })
    }
}

/// Checks that a metadata key is snake_case
///
/// # Errors
///
/// [`WardenError::MissingContextKey`] for an empty key,
/// [`WardenError::InvalidContextKey`] for anything other than
/// `[a-z][a-z0-9_]*`.
pub fn validate_key(key: &str) -> WardenResult<()> {
    let mut chars = key.chars();
    let Some(first) = chars.next() else {
        return Err(WardenError::MissingContextKey);
    };
    let valid = first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(WardenError::InvalidContextKey {
            key: key.to_string(),
        })
    }
}
