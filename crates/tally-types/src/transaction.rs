//! Transactions and attachments as seen by the notary and the fetch protocols.

use crate::{canonical_bytes, PartyName, Result, SecureHash, StateRef, TimeWindow, TransactionId};
use serde::{Deserialize, Serialize};

/// A transaction in its wire form.
///
/// Only the fields the uniqueness provider and the fetch protocols need are
/// modelled; contract state payloads are opaque blobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    /// States consumed by this transaction.
    pub inputs: Vec<StateRef>,
    /// Opaque output state payloads.
    pub outputs: Vec<Vec<u8>>,
    /// Attachments the transaction depends on.
    pub attachments: Vec<SecureHash>,
    /// The notary responsible for the inputs.
    pub notary: PartyName,
    /// Optional validity window.
    pub time_window: Option<TimeWindow>,
}

impl WireTransaction {
    /// Computes the transaction identity over the canonical encoding.
    pub fn id(&self) -> Result<TransactionId> {
        let bytes = canonical_bytes(self)?;
        Ok(TransactionId::new(SecureHash::compute(&bytes)))
    }

    /// References to the outputs this transaction creates.
    pub fn output_refs(&self) -> Result<Vec<StateRef>> {
        let id = self.id()?;
        Ok((0..self.outputs.len() as u32)
            .map(|index| StateRef::new(id, index))
            .collect())
    }
}

/// An immutable blob identified by the hash of its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    id: SecureHash,
    data: Vec<u8>,
}

impl Attachment {
    /// Creates an attachment, computing its id from the bytes.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            id: SecureHash::compute(&data),
            data,
        }
    }

    /// The content hash.
    pub fn id(&self) -> SecureHash {
        self.id
    }

    /// The raw content.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the attachment, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}
