//! Flood sensor: multi-dimensional admission control
//!
//! Each [`ConnectionLimit`] caps how many registered work items may share a
//! dimension (everything, a session, a user, a service). Limits are kept in
//! ascending threshold order so the narrowest saturated dimension is
//! reported first.
//!
//! The incoming work is expected to be registered already: it counts towards
//! its own dimensions, so with a threshold of `L` the `L + 1`-th concurrent
//! item sharing a key is the first one refused.

#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::events::{Event, EventSink, default_sink};
use crate::registry::WorkRegistry;
use crate::work::Work;

/// Dimension counting every registered item
pub const TOTAL: &str = "TOTAL";
/// Dimension keyed by session
pub const SESSION: &str = "SESSION";
/// Dimension keyed by remote user
pub const USER: &str = "USER";
/// Dimension keyed by logical service
pub const SERVICE: &str = "SERVICE";

/// Admission-control configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    /// Size of the resource pool the percentages apply to
    pub max_resources: usize,

    /// Install the four default dimensions
    pub use_defaults: bool,

    /// Share of the pool all work may take together
    pub total_percent: u8,

    /// Share of the pool one session may take
    pub session_percent: u8,

    /// Share of the pool one user may take
    pub user_percent: u8,

    /// Share of the pool one service may take
    pub service_percent: u8,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            max_resources: 60,
            use_defaults: true,
            total_percent: 90,
            session_percent: 40,
            user_percent: 50,
            service_percent: 60,
        }
    }
}

impl FloodConfig {
    /// `percent` of `max_resources`, rounded down
    #[must_use]
    pub fn threshold(&self, percent: u8) -> usize {
        self.max_resources * usize::from(percent) / 100
    }
}

type PredicateFn = dyn Fn(&Work) -> bool + Send + Sync;
type KeyFn = dyn for<'a> Fn(&'a Work) -> Option<&'a str> + Send + Sync;

#[derive(Clone)]
enum Matcher {
    Predicate(Arc<PredicateFn>),
    Key(Arc<KeyFn>),
}

/// One named admission rule
#[derive(Clone)]
pub struct ConnectionLimit {
    name: String,
    threshold: usize,
    message: String,
    matcher: Matcher,
}

impl ConnectionLimit {
    /// Rule counting registered work for which `predicate` holds
    ///
    /// Once the count passes the threshold every incoming item is refused,
    /// whether or not it satisfies the predicate itself.
    pub fn predicate<F>(
        name: impl Into<String>,
        threshold: usize,
        message: impl Into<String>,
        predicate: F,
    ) -> Self
    where
        F: Fn(&Work) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            threshold,
            message: message.into(),
            matcher: Matcher::Predicate(Arc::new(predicate)),
        }
    }

    /// Rule counting registered work sharing the incoming work's key
    ///
    /// Work without a key (absent or blank) is never limited by this rule.
    pub fn keyed<F>(
        name: impl Into<String>,
        threshold: usize,
        message: impl Into<String>,
        key: F,
    ) -> Self
    where
        F: for<'a> Fn(&'a Work) -> Option<&'a str> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            threshold,
            message: message.into(),
            matcher: Matcher::Key(Arc::new(key)),
        }
    }

    /// Default `TOTAL` rule
    pub fn total(threshold: usize) -> Self {
        Self::predicate(TOTAL, threshold, "Too many concurrent requests", |_| true)
    }

    /// Default `SESSION` rule
    pub fn session(threshold: usize) -> Self {
        Self::keyed(SESSION, threshold, "Too many concurrent requests for this session", Work::session)
    }

    /// Default `USER` rule
    pub fn user(threshold: usize) -> Self {
        Self::keyed(USER, threshold, "Too many concurrent requests for this user", Work::user)
    }

    /// Default `SERVICE` rule
    pub fn service(threshold: usize) -> Self {
        Self::keyed(SERVICE, threshold, "Too many concurrent requests for this service", Work::service)
    }

    /// Dimension name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Largest admitted count
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Message reported on rejection
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for ConnectionLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let matcher = match self.matcher {
            Matcher::Predicate(_) => "predicate",
            Matcher::Key(_) => "key",
        };
        f.debug_struct("ConnectionLimit")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("matcher", &matcher)
            .finish()
    }
}

/// Ordered collection of limits, smallest threshold first
#[derive(Debug, Clone, Default)]
pub struct ConnectionLimits {
    limits: Vec<ConnectionLimit>,
}

impl ConnectionLimits {
    /// No limits at all
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits described by `config`
    #[must_use]
    pub fn from_config(config: &FloodConfig) -> Self {
        let mut limits = Self::new();
        if config.use_defaults {
            limits.push(ConnectionLimit::total(config.threshold(config.total_percent)));
            limits.push(ConnectionLimit::session(config.threshold(config.session_percent)));
            limits.push(ConnectionLimit::user(config.threshold(config.user_percent)));
            limits.push(ConnectionLimit::service(config.threshold(config.service_percent)));
        }
        limits
    }

    /// Adds a limit, keeping ascending threshold order
    ///
    /// Limits with equal thresholds keep insertion order.
    pub fn push(&mut self, limit: ConnectionLimit) {
        let pos = self.limits.partition_point(|l| l.threshold <= limit.threshold);
        self.limits.insert(pos, limit);
    }

    /// Builder-style [`push`](Self::push)
    #[must_use]
    pub fn with(mut self, limit: ConnectionLimit) -> Self {
        self.push(limit);
        self
    }

    /// Limits in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionLimit> {
        self.limits.iter()
    }

    /// Looks a limit up by name
    pub fn get(&self, name: &str) -> Option<&ConnectionLimit> {
        self.limits.iter().find(|l| l.name == name)
    }

    /// Number of limits
    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// True without limits
    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }
}

/// Refusal of admission on a saturated dimension
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} ({limit}), retry after {}s", retry_after.as_secs())]
pub struct Rejection {
    /// Dimension that was saturated
    pub limit: String,
    /// Human-readable reason
    pub message: String,
    /// Suggested wait before retrying, whole seconds
    pub retry_after: Duration,
}

/// Result of an admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Work may run
    Proceed,
    /// Work should be refused with a wait hint
    RetryLater(Rejection),
}

impl Admission {
    /// True for [`Admission::Proceed`]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Proceed)
    }

    /// The rejection, if any
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Proceed => None,
            Self::RetryLater(rejection) => Some(rejection),
        }
    }

    /// Wait hint, if rejected
    pub fn retry_after(&self) -> Option<Duration> {
        self.rejection().map(|r| r.retry_after)
    }

    /// Converts into a `Result` for `?` propagation
    ///
    /// # Errors
    ///
    /// Returns the rejection when admission was refused.
    pub fn into_result(self) -> Result<(), Rejection> {
        match self {
            Self::Proceed => Ok(()),
            Self::RetryLater(rejection) => Err(rejection),
        }
    }
}

/// Wait hint in whole seconds: `ceil(min(max_time, elapsed) / 1s)`
///
/// Zero when the matched work started less than a millisecond ago.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn retry_after_secs(max_time: Duration, elapsed: Duration) -> u64 {
    let millis = max_time.min(elapsed).as_millis() as u64;
    millis.div_ceil(1000)
}

/// Admission-control engine over a work registry
pub struct FloodSensor {
    registry: Arc<dyn WorkRegistry>,
    limits: ConnectionLimits,
    sink: Arc<dyn EventSink>,
}

impl FloodSensor {
    /// Creates a sensor evaluating `limits` against `registry`
    ///
    /// # Examples
    ///
    /// ```rust
    /// use pulse_warden::flood::{ConnectionLimits, FloodConfig, FloodSensor};
    /// use pulse_warden::registry::Outstanding;
    /// use pulse_warden::work::Work;
    ///
    /// let registry = Outstanding::new();
    /// let sensor = FloodSensor::new(registry.clone(), ConnectionLimits::from_config(&FloodConfig::default()));
    ///
    /// let work = Work::builder("req-1").session("s").build();
    /// let _ticket = registry.create(work.clone());
    /// assert!(sensor.may_proceed(Some(&work)).is_admitted());
    /// ```
    pub fn new(registry: impl WorkRegistry + 'static, limits: ConnectionLimits) -> Self {
        Self {
            registry: Arc::new(registry),
            limits,
            sink: default_sink(),
        }
    }

    /// Creates a sensor with the limits described by `config`
    pub fn with_config(registry: impl WorkRegistry + 'static, config: &FloodConfig) -> Self {
        Self::new(registry, ConnectionLimits::from_config(config))
    }

    /// Replaces the event sink
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Limits in evaluation order
    pub fn limits(&self) -> &ConnectionLimits {
        &self.limits
    }

    /// Checks one dimension for `incoming`
    ///
    /// Returns the wait hint when the dimension is saturated. A dimension is
    /// charged at most once per work item: once it has rejected `incoming`,
    /// later checks of the same dimension for the same item return `None`.
    pub fn should_retry_later(&self, incoming: &Work, limit: &ConnectionLimit) -> Option<Duration> {
        if incoming.is_checked(&limit.name) {
            return None;
        }

        let (count, oldest) = match &limit.matcher {
            Matcher::Predicate(predicate) => self.count_matching(limit.threshold, |w| predicate(w)),
            Matcher::Key(key_fn) => {
                let key = key_fn(incoming).map(str::trim).filter(|k| !k.is_empty())?;
                self.count_matching(limit.threshold, |w| {
                    key_fn(w).map(str::trim) == Some(key)
                })
            }
        };

        if count <= limit.threshold {
            return None;
        }
        let oldest = oldest?;

        let retry_after = Duration::from_secs(retry_after_secs(incoming.max_time(), oldest.elapsed()));
        let rejection = Rejection {
            limit: limit.name.clone(),
            message: limit.message.clone(),
            retry_after,
        };
        self.sink.on_event(&Event::Rejected {
            work: incoming,
            rejection: &rejection,
        });
        incoming.mark_checked(&limit.name);

        Some(retry_after)
    }

    /// Evaluates every limit, narrowest first
    ///
    /// Absent work is always admitted.
    pub fn may_proceed(&self, incoming: Option<&Work>) -> Admission {
        let Some(incoming) = incoming else {
            return Admission::Proceed;
        };

        for limit in self.limits.iter() {
            if let Some(retry_after) = self.should_retry_later(incoming, limit) {
                return Admission::RetryLater(Rejection {
                    limit: limit.name.clone(),
                    message: limit.message.clone(),
                    retry_after,
                });
            }
        }
        Admission::Proceed
    }

    /// [`may_proceed`](Self::may_proceed) for the calling context's current work
    pub fn may_proceed_current(&self) -> Admission {
        let current = self.registry.current();
        self.may_proceed(current.as_deref())
    }

    // Counts matches up to `threshold + 1`, remembering the first (oldest) one
    fn count_matching(
        &self,
        threshold: usize,
        mut matches: impl FnMut(&Work) -> bool,
    ) -> (usize, Option<Arc<Work>>) {
        let mut count = 0;
        let mut oldest = None;
        for work in self.registry.stream() {
            if !matches(&work) {
                continue;
            }
            count += 1;
            if oldest.is_none() {
                oldest = Some(work);
            }
            if count > threshold {
                break;
            }
        }
        (count, oldest)
    }
}

impl fmt::Debug for FloodSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloodSensor")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::context::{self, Frame};
    use crate::events::NullSink;
    use crate::registry::Outstanding;

    #[test]
    fn test_default_thresholds() {
        let limits = ConnectionLimits::from_config(&FloodConfig::default());
        let order: Vec<(&str, usize)> = limits.iter().map(|l| (l.name(), l.threshold())).collect();
        assert_eq!(
            order,
            vec![(SESSION, 24), (USER, 30), (SERVICE, 36), (TOTAL, 54)]
        );
    }

    #[test]
    fn test_defaults_disabled() {
        let config = FloodConfig {
            use_defaults: false,
            ..FloodConfig::default()
        };
        assert!(ConnectionLimits::from_config(&config).is_empty());
    }

    #[test]
    fn test_push_keeps_order_and_ties() {
        let limits = ConnectionLimits::new()
            .with(ConnectionLimit::total(10))
            .with(ConnectionLimit::session(5))
            .with(ConnectionLimit::user(5))
            .with(ConnectionLimit::service(1));
        let names: Vec<&str> = limits.iter().map(ConnectionLimit::name).collect();
        assert_eq!(names, vec![SERVICE, SESSION, USER, TOTAL]);
    }

    #[test]
    fn test_retry_after_formula() {
        let five_minutes = Duration::from_secs(300);
        assert_eq!(retry_after_secs(five_minutes, Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(five_minutes, Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(five_minutes, Duration::from_secs(600)), 300);
        assert_eq!(retry_after_secs(five_minutes, Duration::ZERO), 0);
        assert_eq!(retry_after_secs(Duration::ZERO, Duration::from_secs(9)), 0);
    }

    #[test]
    fn test_fresh_match_gives_zero_wait() {
        let clock = ManualClock::shared();
        let registry = Outstanding::new();
        let limit = ConnectionLimit::total(0);
        let sensor = FloodSensor::new(registry.clone(), ConnectionLimits::new().with(limit.clone()))
            .with_sink(Arc::new(NullSink));

        let work = Work::builder("w").clock(clock as Arc<dyn Clock>).build();
        let _t = registry.create(work.clone());
        assert_eq!(sensor.should_retry_later(&work, &limit), Some(Duration::ZERO));
    }

    #[test]
    fn test_predicate_limit_refuses_unmatched_incoming() {
        let registry = Outstanding::new();
        let limit = ConnectionLimit::predicate("REPORTS", 1, "Too many reports running", |work: &Work| {
            work.name() == Some("report")
        });
        let sensor = FloodSensor::new(registry.clone(), ConnectionLimits::new().with(limit.clone()))
            .with_sink(Arc::new(NullSink));

        let _r1 = registry.create(Work::builder("r1").name("report").build());
        let _r2 = registry.create(Work::builder("r2").name("report").build());

        let search = Work::builder("s").name("search").build();
        let _ts = registry.create(search.clone());
        assert!(sensor.should_retry_later(&search, &limit).is_some());
        assert!(search.is_checked("REPORTS"));
    }

    #[test]
    fn test_threshold_admits_up_to_limit() {
        context::sync_scope(Frame::new(), || {
            let registry = Outstanding::new();
            let limits = ConnectionLimits::new().with(ConnectionLimit::session(3));
            let sensor = FloodSensor::new(registry.clone(), limits).with_sink(Arc::new(NullSink));

            let mut tickets = Vec::new();
            for i in 0..3 {
                let work = Work::builder(format!("w{i}")).session("s").build();
                tickets.push(registry.create(work.clone()));
                assert!(sensor.may_proceed(Some(&work)).is_admitted(), "item {i} admitted");
            }

            let fourth = Work::builder("w3").session("s").build();
            tickets.push(registry.create(fourth.clone()));
            let admission = sensor.may_proceed(Some(&fourth));
            assert_eq!(admission.rejection().map(|r| r.limit.as_str()), Some(SESSION));
        });
    }

    #[test]
    fn test_blank_key_is_skipped() {
        let registry = Outstanding::new();
        let limit = ConnectionLimit::session(0);
        let sensor = FloodSensor::new(registry.clone(), ConnectionLimits::new().with(limit.clone()))
            .with_sink(Arc::new(NullSink));

        let anonymous = Work::builder("anon").session("   ").build();
        let _t = registry.create(anonymous.clone());
        assert_eq!(sensor.should_retry_later(&anonymous, &limit), None);
        assert!(!anonymous.is_checked(SESSION));
    }

    #[test]
    fn test_checked_dimension_is_not_charged_twice() {
        let registry = Outstanding::new();
        let limit = ConnectionLimit::total(0);
        let sensor = FloodSensor::new(registry.clone(), ConnectionLimits::new().with(limit.clone()))
            .with_sink(Arc::new(NullSink));

        let work = Work::builder("w").build();
        let _t = registry.create(work.clone());
        assert!(sensor.should_retry_later(&work, &limit).is_some());
        assert!(work.is_checked(TOTAL));
        assert_eq!(sensor.should_retry_later(&work, &limit), None);
    }

    #[test]
    fn test_retry_after_uses_oldest_match() {
        let clock = ManualClock::shared();
        let registry = Outstanding::new();
        let limit = ConnectionLimit::total(1);
        let sensor = FloodSensor::new(registry.clone(), ConnectionLimits::new().with(limit.clone()))
            .with_sink(Arc::new(NullSink));

        let build = |id: &str| Work::builder(id).clock(clock.clone() as Arc<dyn Clock>).build();

        let oldest = build("oldest");
        let _t1 = registry.create(oldest);
        clock.advance(Duration::from_millis(7_500));
        let _t2 = registry.create(build("middle"));
        clock.advance(Duration::from_millis(100));
        let incoming = build("incoming");
        let _t3 = registry.create(incoming.clone());

        // Oldest has run 7.6s
        assert_eq!(sensor.should_retry_later(&incoming, &limit), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_absent_work_is_admitted() {
        let sensor = FloodSensor::new(Outstanding::new(), ConnectionLimits::new().with(ConnectionLimit::total(0)));
        assert!(sensor.may_proceed(None).is_admitted());
        context::sync_scope(Frame::new(), || {
            assert!(sensor.may_proceed_current().is_admitted());
        });
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: FloodConfig = serde_json::from_str(r#"{"max_resources": 100}"#).unwrap();
        assert_eq!(config.max_resources, 100);
        assert_eq!(config.session_percent, 40);
        assert_eq!(config.threshold(config.total_percent), 90);
    }
}
