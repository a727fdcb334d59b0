//! Replication log - append-only, durable sequence of entries
//!
//! The in-memory tail mirrors storage. Entries covered by the latest
//! snapshot are discarded; `base_index`/`base_term` describe the last
//! entry the snapshot includes.

use crate::error::{ConsensusError, StorageError};
use crate::storage::LogStorage;
use crate::types::{LogEntry, Snapshot};
use std::sync::Arc;

pub struct ReplicationLog {
    storage: Arc<dyn LogStorage>,
    /// Entries with index > base_index, contiguous
    entries: Vec<LogEntry>,
    base_index: u64,
    base_term: u64,
}

impl ReplicationLog {
    /// Load the log from storage. Also returns the persisted snapshot, if any.
    pub fn open(storage: Arc<dyn LogStorage>) -> Result<(Self, Option<Snapshot>), StorageError> {
        storage.initialize()?;
        let snapshot = storage.load_snapshot()?;
        let (base_index, base_term) = snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((0, 0));

        let entries = storage.read(base_index + 1)?;
        for (offset, entry) in entries.iter().enumerate() {
            let expected = base_index + 1 + offset as u64;
            if entry.index != expected {
                return Err(StorageError::Corrupt {
                    index: entry.index,
                    detail: format!("gap in log, expected index {}", expected),
                });
            }
        }

        tracing::debug!(
            "Loaded log: base {}:{}, {} entries",
            base_index,
            base_term,
            entries.len()
        );

        Ok((
            Self {
                storage,
                entries,
                base_index,
                base_term,
            },
            snapshot,
        ))
    }

    pub fn storage(&self) -> &Arc<dyn LogStorage> {
        &self.storage
    }

    pub fn base_index(&self) -> u64 {
        self.base_index
    }

    pub fn base_term(&self) -> u64 {
        self.base_term
    }

    pub fn last_index(&self) -> u64 {
        self.entries.last().map(|e| e.index).unwrap_or(self.base_index)
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(self.base_term)
    }

    fn offset(&self, index: u64) -> Option<usize> {
        if index <= self.base_index {
            None
        } else {
            Some((index - self.base_index - 1) as usize)
        }
    }

    /// Term of the entry at `index`; `None` if compacted away or beyond the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == self.base_index {
            return Some(self.base_term);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        self.offset(index).and_then(|o| self.entries.get(o))
    }

    /// Log-matching check for a leader's `(prev_log_index, prev_log_term)`
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Up to `max` entries starting at `start`
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(self.base_index + 1);
        match self.offset(start) {
            Some(o) if o < self.entries.len() => {
                let end = (o + max).min(self.entries.len());
                self.entries[o..end].to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// Entries in `(after, through]`
    pub fn entries_between(&self, after: u64, through: u64) -> Vec<LogEntry> {
        if through <= after {
            return Vec::new();
        }
        self.entries_from(after + 1, (through - after) as usize)
    }

    /// Leader-side append of the next entry
    pub fn append(&mut self, entry: LogEntry) -> Result<(), ConsensusError> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(ConsensusError::LogInconsistency {
                index: entry.index,
                detail: format!("append out of order, expected index {}", expected),
            });
        }
        self.storage.append(std::slice::from_ref(&entry))?;
        self.entries.push(entry);
        Ok(())
    }

    /// Follower-side merge of replicated entries.
    ///
    /// Entries already present with the same term are skipped. The first
    /// conflicting entry truncates the local suffix. A conflict at or below
    /// `commit_index` is refused: committed entries never change.
    pub fn merge(&mut self, incoming: &[LogEntry], commit_index: u64) -> Result<(), ConsensusError> {
        let mut first_new = None;
        for (pos, entry) in incoming.iter().enumerate() {
            if entry.index <= self.base_index {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(term) => {
                    if entry.index <= commit_index {
                        return Err(ConsensusError::LogInconsistency {
                            index: entry.index,
                            detail: format!(
                                "leader sent term {} over committed term {}",
                                entry.term, term
                            ),
                        });
                    }
                    tracing::debug!(
                        "Truncating divergent suffix from index {} (term {} != {})",
                        entry.index,
                        term,
                        entry.term
                    );
                    self.truncate_from(entry.index)?;
                    first_new = Some(pos);
                    break;
                }
                None => {
                    first_new = Some(pos);
                    break;
                }
            }
        }

        let Some(pos) = first_new else {
            return Ok(());
        };
        let suffix = &incoming[pos..];
        if suffix[0].index != self.last_index() + 1 {
            return Err(ConsensusError::LogInconsistency {
                index: suffix[0].index,
                detail: format!("gap after local index {}", self.last_index()),
            });
        }
        self.storage.append(suffix)?;
        self.entries.extend(suffix.iter().cloned().map(|mut e| {
            e.committed = false;
            e
        }));
        Ok(())
    }

    /// Delete entries with index >= `index`
    pub fn truncate_from(&mut self, index: u64) -> Result<(), ConsensusError> {
        let Some(offset) = self.offset(index) else {
            return Err(ConsensusError::LogInconsistency {
                index,
                detail: format!("cannot truncate into snapshot at {}", self.base_index),
            });
        };
        self.storage.truncate_from(index)?;
        self.entries.truncate(offset);
        Ok(())
    }

    /// Drop entries covered by a snapshot ending at `(index, term)`
    pub fn compact_through(&mut self, index: u64, term: u64) -> Result<(), ConsensusError> {
        if index <= self.base_index {
            return Ok(());
        }
        let keep_from = self.offset(index + 1).unwrap_or(0).min(self.entries.len());
        self.storage.compact_through(index)?;
        self.entries.drain(..keep_from);
        self.base_index = index;
        self.base_term = term;
        Ok(())
    }

    /// Rebase the log on an installed snapshot. A matching entry keeps the
    /// suffix after it; otherwise the whole log is discarded.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) -> Result<(), ConsensusError> {
        if index <= self.last_index() && self.term_at(index) == Some(term) {
            return self.compact_through(index, term);
        }
        self.storage.truncate_from(0)?;
        self.entries.clear();
        self.base_index = index;
        self.base_term = term;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStorage;
    use crate::types::EntryPayload;

    fn noop(index: u64, term: u64) -> LogEntry {
        LogEntry::new(index, term, EntryPayload::Noop)
    }

    fn open(storage: &MemoryLogStorage) -> ReplicationLog {
        ReplicationLog::open(Arc::new(storage.clone())).unwrap().0
    }

    #[test]
    fn test_append_requires_next_index() {
        let storage = MemoryLogStorage::new();
        let mut log = open(&storage);

        log.append(noop(1, 1)).unwrap();
        assert!(log.append(noop(3, 1)).is_err());
        assert_eq!(log.last_index(), 1);
        assert_eq!(log.term_at(0), Some(0));
        assert!(log.matches(1, 1));
        assert!(!log.matches(1, 2));
    }

    #[test]
    fn test_merge_truncates_divergent_suffix() {
        let storage = MemoryLogStorage::new();
        let mut log = open(&storage);
        for entry in [noop(1, 1), noop(2, 1), noop(3, 2), noop(4, 2)] {
            log.append(entry).unwrap();
        }

        log.merge(&[noop(2, 1), noop(3, 3)], 2).unwrap();

        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
        assert_eq!(storage.read(0).unwrap().len(), 3);
    }

    #[test]
    fn test_merge_never_rewrites_committed() {
        let storage = MemoryLogStorage::new();
        let mut log = open(&storage);
        log.append(noop(1, 1)).unwrap();
        log.append(noop(2, 1)).unwrap();

        let err = log.merge(&[noop(2, 5)], 2).unwrap_err();
        assert!(matches!(err, ConsensusError::LogInconsistency { index: 2, .. }));
        assert_eq!(log.term_at(2), Some(1));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let storage = MemoryLogStorage::new();
        let mut log = open(&storage);
        let batch = vec![noop(1, 1), noop(2, 1)];

        log.merge(&batch, 0).unwrap();
        log.merge(&batch, 0).unwrap();
        assert_eq!(log.last_index(), 2);
    }

    #[test]
    fn test_compaction_and_reopen() {
        let storage = MemoryLogStorage::new();
        let mut log = open(&storage);
        for i in 1..=5 {
            log.append(noop(i, 1)).unwrap();
        }

        storage
            .save_snapshot(&Snapshot {
                last_included_index: 3,
                last_included_term: 1,
                data: Vec::new(),
            })
            .unwrap();
        log.compact_through(3, 1).unwrap();
        assert_eq!(log.term_at(2), None);
        assert_eq!(log.term_at(3), Some(1));
        assert_eq!(log.entries_from(1, 10).len(), 2);

        let (reopened, snapshot) = ReplicationLog::open(Arc::new(storage.clone())).unwrap();
        assert_eq!(snapshot.map(|s| s.last_included_index), Some(3));
        assert_eq!(reopened.base_index(), 3);
        assert_eq!(reopened.last_index(), 5);
    }

    #[test]
    fn test_reset_to_unknown_snapshot_clears_log() {
        let storage = MemoryLogStorage::new();
        let mut log = open(&storage);
        log.append(noop(1, 1)).unwrap();
        log.append(noop(2, 1)).unwrap();

        log.reset_to_snapshot(10, 4).unwrap();
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 4);
        assert!(storage.read(0).unwrap().is_empty());
    }
}
