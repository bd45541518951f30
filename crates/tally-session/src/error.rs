//! Session error types.

use tally_types::PartyName;
use thiserror::Error;

/// Errors raised by the session layer.
///
/// These are structural failures only; protocol-level rejections travel as
/// [`ErrorReport`](crate::ErrorReport)s inside session messages.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A frame could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The link to the peer is down.
    #[error("disconnected from {0}")]
    Disconnected(PartyName),

    /// The peer is not known to the transport.
    #[error("unknown peer: {0}")]
    UnknownPeer(PartyName),

    /// Retries were exhausted; the session is unusable.
    #[error("session to {peer} broken after {attempts} attempts")]
    Broken {
        /// The unreachable peer.
        peer: PartyName,
        /// Attempts made.
        attempts: u32,
    },

    /// The session no longer accepts messages.
    #[error("session is {0}")]
    NotOpen(String),

    /// Payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
