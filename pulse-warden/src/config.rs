//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Warden configuration and presets
//!
//! Every section derives `serde` so it can be loaded from whatever format the
//! host application already uses. Durations are integer `_ms` fields.
//!
//! ```rust
//! use pulse_warden::config::{LimitProfile, WardenConfig};
//!
//! let config = LimitProfile::Strict.create_config();
//! config.validate().unwrap();
//! assert!(config.flood.session_percent < WardenConfig::default().flood.session_percent);
//! ```

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WardenError, WardenResult};
use crate::flood::FloodConfig;
use crate::work::DEFAULT_MAX_TIME;
use crate::zombie::ZombieConfig;

/// Defaults applied to new work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkConfig {
    /// Maximum running time before work counts as a zombie
    pub default_max_time_ms: u64,
}

impl Default for WorkConfig {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            default_max_time_ms: DEFAULT_MAX_TIME.as_millis() as u64,
        }
    }
}

impl WorkConfig {
    /// Maximum running time as a duration
    pub fn default_max_time(&self) -> Duration {
        Duration::from_millis(self.default_max_time_ms)
    }
}

/// Complete warden configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Work defaults
    pub work: WorkConfig,
    /// Admission control
    pub flood: FloodConfig,
    /// Zombie detection
    pub zombie: ZombieConfig,
}

impl WardenConfig {
    /// Checks the configuration for values that cannot work
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> WardenResult<()> {
        if self.work.default_max_time_ms == 0 {
            return Err(invalid("work.default_max_time_ms must be positive"));
        }

        if self.flood.max_resources == 0 {
            return Err(invalid("flood.max_resources must be positive"));
        }
        for (name, percent) in [
            ("total_percent", self.flood.total_percent),
            ("session_percent", self.flood.session_percent),
            ("user_percent", self.flood.user_percent),
            ("service_percent", self.flood.service_percent),
        ] {
            if percent > 100 {
                return Err(invalid(format!("flood.{name} must be at most 100, got {percent}")));
            }
        }

        if self.zombie.period_ms == 0 {
            return Err(invalid("zombie.period_ms must be positive"));
        }
        if self.zombie.thread_name.trim().is_empty() {
            return Err(invalid("zombie.thread_name must not be blank"));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> WardenError {
    WardenError::InvalidConfig(reason.into())
}

/// Preset configurations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitProfile {
    /// Tight shares and fast sweeps
    ///
    /// For latency-critical services where a saturated caller should be
    /// pushed back early and stuck work found quickly.
    Strict,

    /// The documented defaults
    Balanced,

    /// Generous shares and slow sweeps
    ///
    /// For batch or reporting services with legitimately long requests.
    Lenient,
}

impl LimitProfile {
    /// Builds the preset configuration
    pub fn create_config(self) -> WardenConfig {
        match self {
            Self::Strict => WardenConfig {
                work: WorkConfig {
                    default_max_time_ms: 60_000,
                },
                flood: FloodConfig {
                    total_percent: 75,
                    session_percent: 20,
                    user_percent: 25,
                    service_percent: 40,
                    ..FloodConfig::default()
                },
                zombie: ZombieConfig {
                    period_ms: 10_000,
                    watch_ms: 10_000,
                    ..ZombieConfig::default()
                },
            },
            Self::Balanced => WardenConfig::default(),
            Self::Lenient => WardenConfig {
                work: WorkConfig {
                    default_max_time_ms: 15 * 60_000,
                },
                flood: FloodConfig {
                    total_percent: 100,
                    session_percent: 60,
                    user_percent: 75,
                    service_percent: 80,
                    ..FloodConfig::default()
                },
                zombie: ZombieConfig {
                    period_ms: 60_000,
                    watch_ms: 120_000,
                    ..ZombieConfig::default()
                },
            },
        }
    }

    /// One-line description
    pub fn description(self) -> &'static str {
        match self {
            Self::Strict => "Strict limits: small per-caller shares, 1 minute work budget, 10 second sweeps",
            Self::Balanced => "Balanced limits: default shares, 5 minute work budget, 30 second sweeps",
            Self::Lenient => "Lenient limits: large per-caller shares, 15 minute work budget, 1 minute sweeps",
        }
    }

    /// Every preset
    pub fn all() -> &'static [LimitProfile] {
        &[Self::Strict, Self::Balanced, Self::Lenient]
    }
}
