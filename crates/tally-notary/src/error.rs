//! Error types for the uniqueness provider.

use thiserror::Error;

/// Infrastructure faults raised while processing a commitment request.
#[derive(Debug, Error)]
pub enum UniquenessError {
    /// The commitment table could not be read or written.
    #[error("storage unavailable: {0}")]
    Storage(#[from] tally_storage::StorageError),
}

/// A specialized Result type for uniqueness operations.
pub type Result<T> = std::result::Result<T, UniquenessError>;
