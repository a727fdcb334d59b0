//! Persistence Layer for the replication log
//!
//! Uses sled embedded database to persist term/vote, log entries and the
//! latest state snapshot across restarts. Trees are keyed by node id so
//! several nodes may share one database directory.

use crate::error::StorageError;
use crate::storage::LogStorage;
use crate::types::{HardState, LogEntry, Snapshot};
use sequencer_types::NodeId;
use sled::{Batch, Db};
use std::path::Path;

const HARD_STATE_KEY: &str = "hard_state";
const SNAPSHOT_KEY: &str = "snapshot";

/// Sled-backed log storage
pub struct SledLogStorage {
    /// Sled database instance
    db: Db,
    /// Log entries keyed by big-endian index
    log: sled::Tree,
    /// Hard state and snapshot
    meta: sled::Tree,
}

impl SledLogStorage {
    /// Open or create the store for `node_id` at the given path
    pub fn open<P: AsRef<Path>>(path: P, node_id: NodeId) -> Result<Self, StorageError> {
        let db = sled::open(&path)?;
        let store = Self::with_db(db, node_id)?;
        tracing::info!("Opened log store for node {} at {:?}", node_id, path.as_ref());
        Ok(store)
    }

    /// Use an already opened database
    pub fn with_db(db: Db, node_id: NodeId) -> Result<Self, StorageError> {
        let log = db.open_tree(format!("node-{}/log", node_id))?;
        let meta = db.open_tree(format!("node-{}/meta", node_id))?;
        Ok(Self { db, log, meta })
    }

    fn key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<LogEntry, StorageError> {
        let index = key
            .try_into()
            .map(u64::from_be_bytes)
            .map_err(|_| StorageError::Corrupt {
                index: 0,
                detail: "log key is not 8 bytes".to_string(),
            })?;
        let entry: LogEntry = bincode::deserialize(value)?;
        if entry.index != index {
            return Err(StorageError::Corrupt {
                index,
                detail: format!("entry claims index {}", entry.index),
            });
        }
        Ok(entry)
    }

    /// Flush all pending writes to disk
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl LogStorage for SledLogStorage {
    fn initialize(&self) -> Result<(), StorageError> {
        if self.meta.get(HARD_STATE_KEY)?.is_none() {
            self.save_hard_state(&HardState::default())?;
        }
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for entry in entries {
            batch.insert(Self::key(entry.index).to_vec(), bincode::serialize(entry)?);
        }
        self.log.apply_batch(batch)?;
        self.flush()
    }

    fn read(&self, from: u64) -> Result<Vec<LogEntry>, StorageError> {
        let mut entries = Vec::new();
        for result in self.log.range(Self::key(from)..) {
            let (key, value) = result?;
            entries.push(Self::decode(&key, &value)?);
        }
        Ok(entries)
    }

    fn truncate_from(&self, index: u64) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for result in self.log.range(Self::key(index)..) {
            let (key, _) = result?;
            batch.remove(key);
        }
        self.log.apply_batch(batch)?;
        self.flush()
    }

    fn compact_through(&self, index: u64) -> Result<(), StorageError> {
        let mut batch = Batch::default();
        for result in self.log.range(..=Self::key(index)) {
            let (key, _) = result?;
            batch.remove(key);
        }
        self.log.apply_batch(batch)?;
        self.flush()
    }

    fn save_hard_state(&self, state: &HardState) -> Result<(), StorageError> {
        self.meta.insert(HARD_STATE_KEY, bincode::serialize(state)?)?;
        self.flush()
    }

    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        match self.meta.get(HARD_STATE_KEY)? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Ok(HardState::default()),
        }
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.meta.insert(SNAPSHOT_KEY, bincode::serialize(snapshot)?)?;
        self.flush()
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        match self.meta.get(SNAPSHOT_KEY)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn close(&self) -> Result<(), StorageError> {
        self.flush()
    }
}
