//! Error types for the storage layer.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Table name rejected before it reached SQL.
    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    /// Query specification could not be evaluated.
    #[error("invalid query: {0}")]
    Query(#[from] QueryError),

    /// A previous holder of the connection panicked.
    #[error("storage connection lock poisoned")]
    LockPoisoned,

    /// Invalid data.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Errors raised while validating a query specification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("filter on '{prop}' with operator '{op}': {reason}")]
    InvalidFilter {
        prop: String,
        op: String,
        reason: String,
    },
}
