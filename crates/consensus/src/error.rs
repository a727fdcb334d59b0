//! Consensus error types

use sequencer_types::NodeId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("record encoding error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("storage is closed")]
    Closed,

    #[error("corrupt record at index {index}: {detail}")]
    Corrupt { index: u64, detail: String },
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("rpc to node {0} timed out")]
    Timeout(NodeId),

    #[error("no address known for node {0}")]
    UnknownPeer(NodeId),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("message codec error: {0}")]
    Codec(String),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(&'static str),
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Expected: no heartbeat within the election timeout, drives a new election
    #[error("election timeout in term {term}")]
    ElectionTimeout { term: u64 },

    #[error("not the leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// A follower rejected the leader's log position; healed by backtracking
    #[error("log inconsistency at index {index}: {detail}")]
    LogInconsistency { index: u64, detail: String },

    #[error("node is still synchronizing and cannot serve this request")]
    Syncing,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}
