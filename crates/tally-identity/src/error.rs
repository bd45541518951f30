//! Error types for identity operations.

use tally_types::PartyName;
use thiserror::Error;

/// Errors that can occur during identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// The signature verification failed.
    #[error("signature verification failed")]
    InvalidSignature,

    /// The public key is malformed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The secret key is malformed.
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// The key is not held by this node.
    #[error("no private key held for {0}")]
    UnknownKey(String),

    /// A certificate chain is malformed or does not lead to a trusted root.
    #[error("untrusted certificate: {0}")]
    UntrustedCertificate(String),

    /// No well-known identity is registered under this name.
    #[error("unknown party: {0}")]
    UnknownParty(PartyName),

    /// Encoding a certificate failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] tally_types::TypesError),
}

/// A specialized Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;
