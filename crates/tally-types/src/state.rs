//! Record references.

use crate::TransactionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to a piece of ledger state: output `index` of transaction `txhash`.
///
/// A state may be consumed by at most one accepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateRef {
    /// The transaction that created the state.
    pub txhash: TransactionId,
    /// Position of the state among that transaction's outputs.
    pub index: u32,
}

impl StateRef {
    /// Creates a new state reference.
    pub const fn new(txhash: TransactionId, index: u32) -> Self {
        Self { txhash, index }
    }

    /// Encodes the reference as a fixed-width key (32 hash bytes then big-endian index).
    pub fn to_key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[..32].copy_from_slice(self.txhash.as_bytes());
        key[32..].copy_from_slice(&self.index.to_be_bytes());
        key
    }
}

impl fmt::Display for StateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.txhash, self.index)
    }
}
