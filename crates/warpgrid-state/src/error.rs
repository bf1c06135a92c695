//! Error types for the WarpGrid backing store.

use thiserror::Error;

/// Result type alias for backing store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during backing store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch {
        key: String,
        expected: u64,
        found: u64,
    },

    /// The transaction body returned an error; nothing was committed.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}
