//! Cache error types.

use thiserror::Error;

use crate::state::TrackedState;

/// Errors raised by caches, the state tracker, and notify ordering.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Both the current and the requested state are busy; another
    /// operation is still in flight.
    #[error("conflicting state: {current} (requested {requested})")]
    StateConflict {
        current: TrackedState,
        requested: TrackedState,
    },

    #[error("dependency cycle through object type {0}")]
    DependencyCycle(String),

    #[error("failed to encode {typ}: {reason}")]
    Encode { typ: &'static str, reason: String },

    #[error("failed to decode {typ}: {reason}")]
    Decode { typ: &'static str, reason: String },
}

pub type CacheResult<T> = Result<T, CacheError>;
