//! Sequencer State - replicated account state
//!
//! This crate turns the committed log into account state:
//! - `StateStore`: balances, nonces and collected fees
//! - `StateReplication`: ordered, idempotent apply plus snapshots and role fan-out
//! - `NodeSynchronization`: snapshot-based catch-up for joining nodes

pub mod error;
pub mod replication;
pub mod state_store;
pub mod sync;

pub use error::{ReplicationError, SyncError};
pub use replication::{AppliedTransaction, StateReplication};
pub use state_store::{ApplyOutcome, RejectReason, StateSnapshot, StateStore};
pub use sync::{NodeSynchronization, SyncConfig};

/// Applied entries between state snapshots
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 1_000;
