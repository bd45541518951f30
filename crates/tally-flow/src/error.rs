//! Flow error types.

use tally_session::{ErrorReport, SessionError};
use tally_types::PartyName;
use thiserror::Error;

/// Why a flow failed.
///
/// Cloneable so that a terminal status can be observed by any number of
/// handles; wrapped lower-layer errors are kept as their messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// The transport to the counterparty stayed down beyond the retry budget.
    #[error("session to {0} broken")]
    SessionBroken(PartyName),

    /// No message arrived within the receive timeout.
    #[error("counterparty {0} unresponsive")]
    CounterpartyUnresponsive(PartyName),

    /// The counterparty ended the session while a message was expected.
    #[error("session with {0} ended by counterparty")]
    SessionEnded(PartyName),

    /// The counterparty refused to open the session.
    #[error("session rejected by {party}: {reason}")]
    SessionRejected {
        /// The refusing party.
        party: PartyName,
        /// Reason given.
        reason: String,
    },

    /// The counterparty's flow failed and relayed its error.
    #[error("counterparty {party} failed: {report}")]
    CounterpartyFailed {
        /// The failing party.
        party: PartyName,
        /// The relayed error.
        report: ErrorReport,
    },

    /// A protocol check failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A payload did not have the expected type.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// The flow was killed administratively.
    #[error("flow killed")]
    Killed,

    /// The engine stopped before the flow finished.
    #[error("flow engine stopped")]
    EngineStopped,

    /// The flow name is not registered.
    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    /// The flow referenced a session it does not own.
    #[error("unknown session {0}")]
    UnknownSession(u32),

    /// Storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// An identity operation failed.
    #[error("identity error: {0}")]
    Identity(String),

    /// The uniqueness provider failed.
    #[error("uniqueness provider error: {0}")]
    Uniqueness(String),

    /// State or payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The session layer failed.
    #[error("session error: {0}")]
    Session(String),
}

impl FlowError {
    /// Returns true for failures of the runtime rather than of the protocol.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            FlowError::SessionBroken(_)
                | FlowError::CounterpartyUnresponsive(_)
                | FlowError::Storage(_)
                | FlowError::Uniqueness(_)
                | FlowError::Serialization(_)
                | FlowError::Session(_)
        )
    }

    /// The report relayed to counterparties when this error ends a flow.
    pub fn report(&self) -> ErrorReport {
        if self.is_infrastructure() {
            ErrorReport::infrastructure("counterparty flow failed on an internal error")
        } else {
            ErrorReport::rejection(self.to_string())
        }
    }
}

impl From<tally_storage::StorageError> for FlowError {
    fn from(e: tally_storage::StorageError) -> Self {
        FlowError::Storage(e.to_string())
    }
}

impl From<tally_identity::IdentityError> for FlowError {
    fn from(e: tally_identity::IdentityError) -> Self {
        FlowError::Identity(e.to_string())
    }
}

impl From<tally_notary::UniquenessError> for FlowError {
    fn from(e: tally_notary::UniquenessError) -> Self {
        FlowError::Uniqueness(e.to_string())
    }
}

impl From<tally_types::TypesError> for FlowError {
    fn from(e: tally_types::TypesError) -> Self {
        FlowError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Serialization(e.to_string())
    }
}

impl From<SessionError> for FlowError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Broken { peer, .. } => FlowError::SessionBroken(peer),
            other => FlowError::Session(other.to_string()),
        }
    }
}

/// A specialized Result type for flow operations.
pub type FlowResult<T> = std::result::Result<T, FlowError>;
