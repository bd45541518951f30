//! Flow checkpoint storage.

use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tally_types::FlowId;

/// Durable home of suspended flow continuations.
///
/// A checkpoint is opaque bytes; the flow engine owns the format.
pub trait CheckpointStore: Send + Sync {
    /// Writes (or overwrites) the checkpoint of a flow.
    fn save(&self, flow_id: FlowId, checkpoint: Vec<u8>) -> Result<()>;

    /// Deletes the checkpoint of a finished flow.
    fn remove(&self, flow_id: &FlowId) -> Result<()>;

    /// Reads one checkpoint.
    fn load(&self, flow_id: &FlowId) -> Result<Option<Vec<u8>>>;

    /// Reads every checkpoint, ordered by flow id.
    fn load_all(&self) -> Result<Vec<(FlowId, Vec<u8>)>>;
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<BTreeMap<FlowId, Vec<u8>>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    /// Returns true if no checkpoints are stored.
    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&self, flow_id: FlowId, checkpoint: Vec<u8>) -> Result<()> {
        self.checkpoints.write().insert(flow_id, checkpoint);
        Ok(())
    }

    fn remove(&self, flow_id: &FlowId) -> Result<()> {
        self.checkpoints.write().remove(flow_id);
        Ok(())
    }

    fn load(&self, flow_id: &FlowId) -> Result<Option<Vec<u8>>> {
        Ok(self.checkpoints.read().get(flow_id).cloned())
    }

    fn load_all(&self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        Ok(self
            .checkpoints
            .read()
            .iter()
            .map(|(id, bytes)| (*id, bytes.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_overwrite_remove() {
        let store = MemoryCheckpointStore::new();
        let flow = FlowId::random();
        store.save(flow, b"one".to_vec()).unwrap();
        store.save(flow, b"two".to_vec()).unwrap();
        assert_eq!(store.load(&flow).unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len(), 1);

        store.remove(&flow).unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }
}
