//! State replication and synchronization errors

use sequencer_consensus::{ConsensusError, TransportError};
use sequencer_types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    /// An entry skipped ahead of the last applied index
    #[error("out-of-order apply: expected index {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("snapshot covers index {claimed} but its state is at {actual}")]
    SnapshotMismatch { claimed: u64, actual: u64 },

    #[error("state encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no reachable leader accepted the sync request")]
    NoLeader,

    #[error("sync with node {leader} did not complete within {waited_ms}ms")]
    Timeout { leader: NodeId, waited_ms: u64 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),
}
