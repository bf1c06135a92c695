//! Upgrade error types.

use thiserror::Error;
use warpgrid_state::StateError;

pub type UpgradeResult<T> = Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The store is at a version this build does not know about.
    #[error("unknown schema version {0:?}")]
    UnknownVersion(String),

    #[error("upgrade {name} failed: {source}")]
    StepFailed {
        name: String,
        source: Box<UpgradeError>,
    },

    #[error("failed to write version marker {version}: {source}")]
    VersionMarker { version: String, source: StateError },

    #[error("invalid version registry: {0}")]
    Registry(String),

    #[error("failed to decode {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("failed to encode {key}: {reason}")]
    Encode { key: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
