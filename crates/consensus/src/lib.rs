//! Sequencer Consensus - Raft leader election and log replication
//!
//! Architecture:
//! - `RaftCore` holds the protocol state and persists term/vote/log before answering
//! - `RaftNode` drives it with election timers, heartbeats and RPC fan-out
//! - Committed entries flow to the state machine over the apply channel
//! - Role changes are broadcast as typed `RoleChange` events
//! - Transports: in-process `LocalNetwork` and websocket `WsTransport`

pub mod error;
pub mod log;
pub mod network;
pub mod node;
pub mod persistence;
pub mod raft;
pub mod rpc;
pub mod storage;
pub mod transport;
pub mod types;

pub use error::{ConsensusError, StorageError, TransportError};
pub use log::ReplicationLog;
pub use network::{RpcServer, WsTransport};
pub use node::RaftNode;
pub use persistence::SledLogStorage;
pub use raft::{Outbound, RaftCore};
pub use rpc::*;
pub use storage::{LogStorage, MemoryLogStorage};
pub use transport::{LocalNetwork, RaftTransport, RpcHandler};
pub use types::*;
