//! RocksDB persistent storage backend.
//!
//! One database holds the commitment table, flow checkpoints and records in
//! separate column families. Commitment writes go through a single
//! `WriteBatch` with a synced WAL, so a crash can never leave part of a
//! request's states bound.

use crate::commitment::{stripe_of, stripes_for, DEFAULT_STRIPES};
use crate::{
    CheckpointStore, CommitResult, CommitmentStore, ConsumingTx, Record, RecordStore, Result,
    StorageError,
};
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tally_types::{FlowId, PartyName, StateRef, TransactionId};

/// RocksDB storage configuration.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Write buffer size in bytes.
    pub write_buffer_size: usize,

    /// Number of background compaction threads.
    pub background_jobs: i32,

    /// Enable LZ4 compression.
    pub compression_enabled: bool,

    /// Bloom filter bits per key (0 to disable).
    pub bloom_filter_bits: i32,

    /// Number of lock stripes guarding the commitment table.
    pub commit_stripes: usize,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/rocksdb"),
            write_buffer_size: 64 * 1024 * 1024, // 64 MB
            background_jobs: 4,
            compression_enabled: true,
            bloom_filter_bits: 10,
            commit_stripes: DEFAULT_STRIPES,
        }
    }
}

/// Column family names.
const CF_COMMITMENTS: &str = "commitments";
const CF_CHECKPOINTS: &str = "checkpoints";
const CF_RECORDS: &str = "records";

/// RocksDB persistent storage.
pub struct RocksDbStorage {
    db: DB,
    stripes: Vec<Mutex<()>>,
    stats: RocksDbStats,
}

#[derive(Debug, Default)]
struct RocksDbStats {
    reads: AtomicU64,
    writes: AtomicU64,
}

fn backend(e: rocksdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

impl RocksDbStorage {
    /// Opens or creates a RocksDB database.
    pub fn open(config: RocksDbConfig) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.increase_parallelism(config.background_jobs);
        opts.set_max_background_jobs(config.background_jobs);

        if config.compression_enabled {
            opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        }

        let mut block_opts = BlockBasedOptions::default();
        if config.bloom_filter_bits > 0 {
            block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        }
        opts.set_block_based_table_factory(&block_opts);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_COMMITMENTS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_CHECKPOINTS, opts.clone()),
            ColumnFamilyDescriptor::new(CF_RECORDS, opts.clone()),
        ];

        let db = DB::open_cf_descriptors(&opts, &config.path, cfs).map_err(backend)?;
        tracing::info!(path = %config.path.display(), "Opened RocksDB storage");

        Ok(Self {
            db,
            stripes: (0..config.commit_stripes.max(1))
                .map(|_| Mutex::new(()))
                .collect(),
            stats: RocksDbStats::default(),
        })
    }

    /// Opens with default configuration.
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(RocksDbConfig {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Corruption(format!("missing column family {}", name)))
    }

    fn sync_writes() -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(true);
        opts
    }

    fn record_key<R: Record>(id: &R::Id) -> Result<Vec<u8>> {
        let mut key = R::KIND.as_bytes().to_vec();
        key.push(b':');
        key.extend(serde_json::to_vec(id)?);
        Ok(key)
    }

    /// Returns (reads, writes) performed so far.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.reads.load(Ordering::Relaxed),
            self.stats.writes.load(Ordering::Relaxed),
        )
    }
}

impl CommitmentStore for RocksDbStorage {
    fn commit_all(
        &self,
        tx_id: TransactionId,
        states: &BTreeMap<StateRef, u32>,
        caller: &PartyName,
    ) -> Result<CommitResult> {
        let cf = self.cf(CF_COMMITMENTS)?;
        let _guards: Vec<_> = stripes_for(states, self.stripes.len())
            .into_iter()
            .map(|index| self.stripes[index].lock())
            .collect();

        let mut existing = BTreeMap::new();
        for state in states.keys() {
            self.stats.reads.fetch_add(1, Ordering::Relaxed);
            if let Some(bytes) = self.db.get_cf(cf, state.to_key()).map_err(backend)? {
                existing.insert(*state, serde_json::from_slice::<ConsumingTx>(&bytes)?);
            }
        }
        if !existing.is_empty() {
            return Ok(CommitResult::AlreadyCommitted(existing));
        }

        let mut batch = WriteBatch::default();
        for (state, input_index) in states {
            let consumer = ConsumingTx {
                id: tx_id,
                input_index: *input_index,
                requesting_party: caller.clone(),
            };
            batch.put_cf(cf, state.to_key(), serde_json::to_vec(&consumer)?);
        }
        self.db
            .write_opt(batch, &Self::sync_writes())
            .map_err(backend)?;
        self.stats
            .writes
            .fetch_add(states.len() as u64, Ordering::Relaxed);
        Ok(CommitResult::Committed)
    }

    fn get(&self, state: &StateRef) -> Result<Option<ConsumingTx>> {
        let cf = self.cf(CF_COMMITMENTS)?;
        let _guard = self.stripes[stripe_of(state, self.stripes.len())].lock();
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        match self.db.get_cf(cf, state.to_key()).map_err(backend)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn len(&self) -> Result<usize> {
        let cf = self.cf(CF_COMMITMENTS)?;
        let mut count = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item.map_err(backend)?;
            count += 1;
        }
        Ok(count)
    }
}

impl CheckpointStore for RocksDbStorage {
    fn save(&self, flow_id: FlowId, checkpoint: Vec<u8>) -> Result<()> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.db
            .put_cf_opt(cf, flow_id.as_bytes(), checkpoint, &Self::sync_writes())
            .map_err(backend)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(&self, flow_id: &FlowId) -> Result<()> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.db
            .delete_cf_opt(cf, flow_id.as_bytes(), &Self::sync_writes())
            .map_err(backend)
    }

    fn load(&self, flow_id: &FlowId) -> Result<Option<Vec<u8>>> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.db.get_cf(cf, flow_id.as_bytes()).map_err(backend)
    }

    fn load_all(&self) -> Result<Vec<(FlowId, Vec<u8>)>> {
        let cf = self.cf(CF_CHECKPOINTS)?;
        let mut checkpoints = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item.map_err(backend)?;
            let id: [u8; 16] = key.as_ref().try_into().map_err(|_| {
                StorageError::Corruption(format!("checkpoint key of {} bytes", key.len()))
            })?;
            checkpoints.push((FlowId::from_bytes(id), value.to_vec()));
        }
        Ok(checkpoints)
    }
}

impl<R: Record> RecordStore<R> for RocksDbStorage {
    fn load(&self, id: &R::Id) -> Result<Option<R>> {
        let cf = self.cf(CF_RECORDS)?;
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        match self
            .db
            .get_cf(cf, Self::record_key::<R>(id)?)
            .map_err(backend)?
        {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn persist(&self, record: R) -> Result<bool> {
        let cf = self.cf(CF_RECORDS)?;
        let key = Self::record_key::<R>(&record.record_id()?)?;
        if self.db.get_pinned_cf(cf, &key).map_err(backend)?.is_some() {
            return Ok(false);
        }
        self.db
            .put_cf(cf, &key, serde_json::to_vec(&record)?)
            .map_err(backend)?;
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn len(&self) -> Result<usize> {
        let cf = self.cf(CF_RECORDS)?;
        let mut prefix = R::KIND.as_bytes().to_vec();
        prefix.push(b':');
        let mut count = 0;
        for item in self.db.prefix_iterator_cf(cf, &prefix) {
            let (key, _) = item.map_err(backend)?;
            if !key.starts_with(&prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}
