//! Core types for consensus and log replication

use borsh::{BorshDeserialize, BorshSerialize};
use sequencer_types::{NodeId, Transaction};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Appended by a new leader so earlier-term entries can commit through it
    Noop,
    /// A client transaction
    Transaction(Transaction),
}

/// A single replicated log entry
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (first entry is 1)
    pub index: u64,
    /// Term of the leader that created the entry
    pub term: u64,
    /// Entry contents
    pub payload: EntryPayload,
    /// Derived from the commit index when handed out, never persisted
    #[borsh(skip)]
    #[serde(skip)]
    pub committed: bool,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, payload: EntryPayload) -> Self {
        Self {
            index,
            term,
            payload,
            committed: false,
        }
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        match &self.payload {
            EntryPayload::Transaction(tx) => Some(tx),
            EntryPayload::Noop => None,
        }
    }
}

/// Node role in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

/// Typed role-change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleChange {
    BecameLeader { term: u64 },
    BecameCandidate { term: u64 },
    BecameFollower { term: u64, leader_id: Option<NodeId> },
}

impl RoleChange {
    pub fn term(&self) -> u64 {
        match self {
            RoleChange::BecameLeader { term }
            | RoleChange::BecameCandidate { term }
            | RoleChange::BecameFollower { term, .. } => *term,
        }
    }
}

/// Term and vote, persisted before any vote is cast or requested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// Point-in-time state machine image covering the log up to `last_included_index`
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    /// Opaque state machine bytes
    pub data: Vec<u8>,
}

/// Work handed from consensus to the state machine, in order
#[derive(Debug, Clone)]
pub enum ApplyMsg {
    /// Replace the state machine wholesale
    Snapshot(Snapshot),
    /// Committed entries in strictly increasing index order
    Entries(Vec<LogEntry>),
}

/// Configuration for a consensus node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's identity
    pub node_id: NodeId,
    /// Voting peers (excluding this node)
    pub peers: Vec<NodeId>,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    /// Bound on every outbound RPC
    pub rpc_timeout: Duration,
    /// Maximum entries carried by one AppendEntries
    pub max_entries_per_append: usize,
    /// Start as a non-voting observer until a snapshot sync completes
    pub join_as_observer: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            peers: Vec::new(),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(600),
            heartbeat_interval: Duration::from_millis(75),
            rpc_timeout: Duration::from_millis(250),
            max_entries_per_append: 256,
            join_as_observer: false,
        }
    }
}

/// Stats about the consensus node
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsensusStats {
    pub current_term: u64,
    pub commit_index: u64,
    pub last_log_index: u64,
    pub elections_started: u64,
    pub terms_led: u64,
    pub append_rejections: u64,
}
