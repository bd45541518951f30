//! Type-level validation errors.

use thiserror::Error;

/// Errors raised when constructing or parsing core types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// A hex string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// A party name failed validation.
    #[error("invalid party name: {0}")]
    InvalidPartyName(String),

    /// A time window has its bounds the wrong way round.
    #[error("invalid time window: {0}")]
    InvalidTimeWindow(String),

    /// Canonical encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for type construction.
pub type Result<T> = std::result::Result<T, TypesError>;
