//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! One registry with its sensor, detector and decorator, built from config

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use crate::config::WardenConfig;
use crate::error::WardenResult;
use crate::events::{EventSink, TeeSink, default_sink};
use crate::flood::{ConnectionLimit, ConnectionLimits, FloodSensor};
use crate::metrics::WardenMetrics;
use crate::propagate::Decorator;
use crate::registry::Outstanding;
use crate::work::WorkKind;
use crate::zombie::ZombieDetector;

/// The four components wired to a single registry
///
/// Admission only counts request work; delegated tasks share the registry
/// but are seen by the detector alone. Events go to the default sink and to
/// [`Warden::metrics`].
///
/// ```rust
/// use pulse_warden::registry::WorkRegistry;
/// use pulse_warden::{Warden, WardenConfig};
///
/// let warden = Warden::from_config(WardenConfig::default()).unwrap();
/// warden.start().unwrap();
/// assert!(warden.registry().is_empty());
/// warden.close();
/// ```
pub struct Warden {
    config: WardenConfig,
    registry: Outstanding,
    sensor: FloodSensor,
    detector: ZombieDetector,
    decorator: Decorator,
    metrics: Arc<WardenMetrics>,
    sink: Arc<dyn EventSink>,
}

impl Warden {
    /// Validates `config` and builds the components
    ///
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn from_config(config: WardenConfig) -> WardenResult<Self> {
        Self::with_limits(config, std::iter::empty())
    }

    /// Like [`from_config`](Self::from_config), adding custom limits to the
    /// configured ones
    ///
    /// # Errors
    ///
    /// Returns the validation error of an unusable configuration.
    pub fn with_limits(
        config: WardenConfig,
        extra: impl IntoIterator<Item = ConnectionLimit>,
    ) -> WardenResult<Self> {
        config.validate()?;

        let metrics = Arc::new(WardenMetrics::new());
        let sink: Arc<dyn EventSink> = Arc::new(TeeSink::new().with(default_sink()).with(metrics.clone()));
        let registry = Outstanding::new();

        let mut limits = ConnectionLimits::from_config(&config.flood);
        for limit in extra {
            limits.push(limit);
        }

        let sensor = FloodSensor::new(registry.filtered(WorkKind::Request), limits).with_sink(sink.clone());
        let detector = ZombieDetector::new(registry.clone(), config.zombie.clone()).with_sink(sink.clone());
        let decorator = Decorator::new()
            .registering(registry.filtered(WorkKind::Task))
            .with_sink(sink.clone())
            .with_max_time(config.work.default_max_time());

        Ok(Self {
            config,
            registry,
            sensor,
            detector,
            decorator,
            metrics,
            sink,
        })
    }

    /// Starts the zombie detector
    ///
    /// # Errors
    ///
    /// Returns [`crate::WardenError::DetectorSpawn`] if its thread cannot start.
    pub fn start(&self) -> WardenResult<()> {
        self.detector.start()
    }

    /// Stops the zombie detector
    pub fn close(&self) {
        self.detector.close();
    }

    /// Configuration the warden was built from
    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Maximum time given to new work
    pub fn default_max_time(&self) -> Duration {
        self.config.work.default_max_time()
    }

    /// The shared registry
    pub fn registry(&self) -> &Outstanding {
        &self.registry
    }

    /// Admission control over the request work in the registry
    pub fn sensor(&self) -> &FloodSensor {
        &self.sensor
    }

    /// Zombie detector over the registry
    pub fn detector(&self) -> &ZombieDetector {
        &self.detector
    }

    /// Decorator registering delegated tasks in the registry
    pub fn decorator(&self) -> &Decorator {
        &self.decorator
    }

    /// Counters fed by every component
    pub fn metrics(&self) -> &Arc<WardenMetrics> {
        &self.metrics
    }

    /// Sink shared by every component, for boundaries reporting their own events
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }
}

impl std::fmt::Debug for Warden {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warden")
            .field("registry", &self.registry)
            .field("sensor", &self.sensor)
            .field("detector", &self.detector)
            .finish_non_exhaustive()
    }
}
