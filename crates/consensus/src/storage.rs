//! Persistence layer interface for the replication log
//!
//! Every mutating call must be durable before it returns: consensus
//! acknowledges votes and appends only after the write lands.

use crate::error::StorageError;
use crate::types::{HardState, LogEntry, Snapshot};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Durable storage for term/vote, log entries and the latest snapshot
pub trait LogStorage: Send + Sync {
    /// Prepare the backend for use (idempotent)
    fn initialize(&self) -> Result<(), StorageError>;

    /// Persist entries, replacing any existing entry at the same index
    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Read all entries with index >= `from`, ascending
    fn read(&self, from: u64) -> Result<Vec<LogEntry>, StorageError>;

    /// Delete entries with index >= `index`
    fn truncate_from(&self, index: u64) -> Result<(), StorageError>;

    /// Delete entries with index <= `index`
    fn compact_through(&self, index: u64) -> Result<(), StorageError>;

    fn save_hard_state(&self, state: &HardState) -> Result<(), StorageError>;

    fn load_hard_state(&self) -> Result<HardState, StorageError>;

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Flush and release the backend
    fn close(&self) -> Result<(), StorageError>;
}

#[derive(Default)]
struct MemoryInner {
    log: BTreeMap<u64, LogEntry>,
    hard_state: HardState,
    snapshot: Option<Snapshot>,
    closed: bool,
}

/// In-process storage. Clones share the same data, so a "restarted" node
/// built from a clone sees everything the previous instance persisted.
#[derive(Clone, Default)]
pub struct MemoryLogStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryLogStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_open<T>(
        &self,
        f: impl FnOnce(&mut MemoryInner) -> T,
    ) -> Result<T, StorageError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(f(&mut inner))
    }
}

impl LogStorage for MemoryLogStorage {
    fn initialize(&self) -> Result<(), StorageError> {
        self.inner.lock().closed = false;
        Ok(())
    }

    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.with_open(|inner| {
            for entry in entries {
                let mut stored = entry.clone();
                stored.committed = false;
                inner.log.insert(entry.index, stored);
            }
        })
    }

    fn read(&self, from: u64) -> Result<Vec<LogEntry>, StorageError> {
        self.with_open(|inner| inner.log.range(from..).map(|(_, e)| e.clone()).collect())
    }

    fn truncate_from(&self, index: u64) -> Result<(), StorageError> {
        self.with_open(|inner| {
            inner.log.split_off(&index);
        })
    }

    fn compact_through(&self, index: u64) -> Result<(), StorageError> {
        self.with_open(|inner| {
            inner.log = inner.log.split_off(&(index + 1));
        })
    }

    fn save_hard_state(&self, state: &HardState) -> Result<(), StorageError> {
        self.with_open(|inner| inner.hard_state = *state)
    }

    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        self.with_open(|inner| inner.hard_state)
    }

    fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.with_open(|inner| inner.snapshot = Some(snapshot.clone()))
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        self.with_open(|inner| inner.snapshot.clone())
    }

    fn close(&self) -> Result<(), StorageError> {
        self.inner.lock().closed = true;
        Ok(())
    }
}
