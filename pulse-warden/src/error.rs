#![forbid(unsafe_code)]

//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Error types shared across the crate

use std::io;
use std::time::Duration;

use crate::work::Work;

/// Result alias for fallible warden operations
pub type WardenResult<T> = Result<T, WardenError>;

/// Errors raised by registry, configuration and detector operations
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Context key is not snake_case
    #[error("Invalid context key {key:?}: keys must be snake_case")]
    InvalidContextKey {
        /// The rejected key
        key: String,
    },

    /// Context key is empty
    #[error("Context key must not be empty")]
    MissingContextKey,

    /// Zombie detector thread could not be spawned
    #[error("Failed to spawn zombie detector thread: {0}")]
    DetectorSpawn(#[source] io::Error),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Abort signal for work that outlived its allowance
///
/// Returned by [`crate::kill_runaway`] and
/// [`crate::zombie::ZombieDetector::kill_runaway`]. Code is expected to
/// propagate it with `?` up to the request boundary, which answers with a
/// gateway-timeout status and logs it at error level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Work {id} aborted after {elapsed:?} (allowed {max_time:?})")]
pub struct ZombieAbort {
    /// Identifier of the aborted work
    pub id: String,
    /// Top-level request identifier of the aborted work
    pub root_id: String,
    /// Time the work had been running
    pub elapsed: Duration,
    /// Maximum time the work was allowed
    pub max_time: Duration,
}

impl ZombieAbort {
    /// Abort signal describing `work` as it stands now
    pub fn of(work: &Work) -> Self {
        Self {
            id: work.id().to_string(),
            root_id: work.root_id().to_string(),
            elapsed: work.elapsed(),
            max_time: work.max_time(),
        }
    }
}
