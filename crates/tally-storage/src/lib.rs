//! Storage contracts for Tally.
//!
//! Three stores back a node:
//!
//! - [`RecordStore`]: write-once, content-addressed records (attachments,
//!   transactions) used as the local cache by the fetch protocols.
//! - [`CheckpointStore`]: the serialized continuation of every suspended flow.
//! - [`CommitmentStore`]: the append-only `state -> consuming transaction`
//!   table behind the uniqueness provider. Its only mutation is an atomic
//!   multi-key check-and-insert.
//!
//! In-memory implementations are always available; a RocksDB backend for all
//! three is behind the `rocksdb-backend` feature.

mod checkpoint;
mod commitment;
mod error;
mod record;

#[cfg(feature = "rocksdb-backend")]
mod rocksdb;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore};
pub use commitment::{CommitResult, CommitmentStore, ConsumingTx, MemoryCommitmentStore};
pub use error::StorageError;
pub use record::{MemoryRecordStore, Record, RecordStore};

#[cfg(feature = "rocksdb-backend")]
pub use self::rocksdb::{RocksDbConfig, RocksDbStorage};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
