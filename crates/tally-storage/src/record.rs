//! Content-addressed record storage.

use crate::{Result, StorageError};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use tally_types::{Attachment, SecureHash, TransactionId, WireTransaction};

/// A value identified by (a hash of) its own content.
pub trait Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifier type.
    type Id: Clone + Eq + Hash + Ord + fmt::Debug + fmt::Display + Serialize + Send + Sync;

    /// Short tag distinguishing record kinds that share a backend.
    const KIND: &'static str;

    /// Computes the identifier from the record's content.
    fn record_id(&self) -> Result<Self::Id>;
}

impl Record for Attachment {
    type Id = SecureHash;
    const KIND: &'static str = "attachment";

    fn record_id(&self) -> Result<SecureHash> {
        Ok(self.id())
    }
}

impl Record for WireTransaction {
    type Id = TransactionId;
    const KIND: &'static str = "transaction";

    fn record_id(&self) -> Result<TransactionId> {
        self.id()
            .map_err(|e| StorageError::Corruption(format!("unhashable transaction: {}", e)))
    }
}

/// Load/persist contract for records.
///
/// Writes are idempotent: persisting a record that is already present is a no-op.
pub trait RecordStore<R: Record>: Send + Sync {
    /// Loads a record by id.
    fn load(&self, id: &R::Id) -> Result<Option<R>>;

    /// Persists a record. Returns `true` if it was not already stored.
    fn persist(&self, record: R) -> Result<bool>;

    /// Checks whether a record exists.
    fn contains(&self, id: &R::Id) -> Result<bool> {
        Ok(self.load(id)?.is_some())
    }

    /// Number of stored records.
    fn len(&self) -> Result<usize>;

    /// Returns true if the store is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-memory record store.
#[derive(Debug)]
pub struct MemoryRecordStore<R: Record> {
    records: RwLock<HashMap<R::Id, R>>,
}

impl<R: Record> Default for MemoryRecordStore<R> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<R: Record> MemoryRecordStore<R> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<R: Record> RecordStore<R> for MemoryRecordStore<R> {
    fn load(&self, id: &R::Id) -> Result<Option<R>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn persist(&self, record: R) -> Result<bool> {
        let id = record.record_id()?;
        let mut records = self.records.write();
        if records.contains_key(&id) {
            return Ok(false);
        }
        tracing::trace!(kind = R::KIND, id = %id, "Persisted record");
        records.insert(id, record);
        Ok(true)
    }

    fn contains(&self, id: &R::Id) -> Result<bool> {
        Ok(self.records.read().contains_key(id))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.records.read().len())
    }
}
