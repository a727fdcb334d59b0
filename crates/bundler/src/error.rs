//! Bundler, settlement and sequencer errors

use crate::bundle::{BundleId, BundleStatus};
use sequencer_consensus::{ConsensusError, TransportError};
use sequencer_state::{ReplicationError, SyncError};
use sequencer_types::TransactionError;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SettlementError {
    #[error("settlement rejected the bundle: {0}")]
    Rejected(String),

    #[error("settlement did not answer within {ms}ms")]
    Timeout { ms: u64 },

    #[error("settlement layer unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum BundlerError {
    #[error("unknown bundle {0}")]
    UnknownBundle(BundleId),

    #[error("bundle {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: BundleId,
        from: BundleStatus,
        to: BundleStatus,
    },

    /// Another attempt holds the bundle, or it already left Ready
    #[error("bundle {id} is {status:?}, not Ready")]
    NotReady { id: BundleId, status: BundleStatus },

    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

#[derive(Debug, Error)]
pub enum SequencerError {
    #[error("no leader available")]
    NoLeaderAvailable,

    #[error("invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("gas limit {gas_limit} exceeds the bundle maximum {max}")]
    GasLimitExceeded { gas_limit: u64, max: u64 },

    #[error("transaction rejected by leader: {0}")]
    Rejected(String),

    #[error("invalid sequencer setup: {0}")]
    Config(String),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Bundler(#[from] BundlerError),
}
