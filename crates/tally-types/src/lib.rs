//! Common types used throughout `tally`.
//!
//! This crate provides the data model shared by every layer of the Tally
//! ledger node: content hashes, record references, party names, flow
//! identifiers, time windows and the canonical byte encoding that signatures
//! and hashes are computed over.

mod canonical;
mod error;
mod hash;
mod party;
mod state;
mod time;
mod transaction;

pub use canonical::{canonical_bytes, SerializedBytes};
pub use error::{Result, TypesError};
pub use hash::{SecureHash, TransactionId};
pub use party::PartyName;
pub use state::StateRef;
pub use time::{Clock, ManualClock, SystemClock, TimeWindow, Timestamp};
pub use transaction::{Attachment, WireTransaction};

use serde::{Deserialize, Serialize};

/// The unique namespace prefix mixed into every signature made by a node.
pub const NAMESPACE: &[u8] = b"_TALLY";

/// A unique identifier for a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(uuid::Uuid);

impl FlowId {
    /// Allocates a fresh random flow id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Creates a flow id from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(uuid::Uuid::from_bytes(bytes))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
