//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
///
/// Storage only reports structural failure; it never decides whether a
/// commitment is a conflict.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A corruption was detected.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The persistence engine reported a failure.
    #[error("backend error: {0}")]
    Backend(String),
}
