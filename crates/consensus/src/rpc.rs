//! Node-to-node RPC messages
//!
//! Transport-agnostic request/response enums. Network transports wrap
//! them in an [`Envelope`] and encode with borsh.

use crate::types::{LogEntry, Snapshot};
use borsh::{BorshDeserialize, BorshSerialize};
use sequencer_types::{NodeId, Transaction, TransactionId};

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success: last index known to match the leader.
    /// On rejection: the follower's last log index, a lower bound hint for backtracking.
    pub match_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
    /// Log entries after the snapshot
    pub tail: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
    pub success: bool,
    pub match_index: u64,
}

/// Follower to leader transaction hand-off
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ForwardTransactionRequest {
    /// Leader the sender believes is current
    pub leader_id: NodeId,
    pub transaction: Transaction,
}

/// Result of handing a transaction to the leader
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ForwardStatus {
    /// Appended to the leader's log
    Pending { index: u64, term: u64 },
    /// Already known to the leader
    Duplicate,
    /// Refused by validation
    Rejected(String),
    /// The receiver is not the leader
    NotLeader { leader_hint: Option<NodeId> },
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ForwardTransactionResponse {
    pub id: TransactionId,
    pub status: ForwardStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncRequest {
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SyncResponse {
    pub success: bool,
    pub leader_hint: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RpcRequest {
    RequestVote(RequestVoteRequest),
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    ForwardTransaction(ForwardTransactionRequest),
    Sync(SyncRequest),
}

impl RpcRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            RpcRequest::RequestVote(_) => "RequestVote",
            RpcRequest::AppendEntries(_) => "AppendEntries",
            RpcRequest::InstallSnapshot(_) => "InstallSnapshot",
            RpcRequest::ForwardTransaction(_) => "ForwardTransaction",
            RpcRequest::Sync(_) => "Sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum RpcResponse {
    RequestVote(RequestVoteResponse),
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    ForwardTransaction(ForwardTransactionResponse),
    Sync(SyncResponse),
    /// The receiver could not process the request
    Error(String),
}

/// Wire frame for both directions
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub enum Envelope {
    Request {
        request_id: u64,
        from: NodeId,
        body: RpcRequest,
    },
    Response {
        request_id: u64,
        body: RpcResponse,
    },
}

impl Envelope {
    pub fn to_bytes(&self) -> Vec<u8> {
        borsh::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, std::io::Error> {
        borsh::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryPayload;

    #[test]
    fn test_envelope_skips_committed_flag() {
        let mut entry = LogEntry::new(3, 2, EntryPayload::Noop);
        entry.committed = true;
        let envelope = Envelope::Request {
            request_id: 9,
            from: 1,
            body: RpcRequest::AppendEntries(AppendEntriesRequest {
                term: 2,
                leader_id: 1,
                prev_log_index: 2,
                prev_log_term: 2,
                entries: vec![entry],
                leader_commit: 2,
            }),
        };

        let decoded = Envelope::from_bytes(&envelope.to_bytes()).unwrap();
        match decoded {
            Envelope::Request {
                request_id: 9,
                from: 1,
                body: RpcRequest::AppendEntries(req),
            } => {
                assert_eq!(req.entries.len(), 1);
                assert!(!req.entries[0].committed);
            }
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(Envelope::from_bytes(&[0xff, 0x01]).is_err());
    }
}
