//! Node synchronization
//!
//! A joining or recovering node asks the leader for a `SyncRequest`; the
//! leader pushes a fresh state snapshot plus its log tail through
//! `InstallSnapshot`. The joiner stays a non-voting observer until the
//! snapshot is installed and every committed entry has been applied, and
//! replicates as a learner afterwards.
//!
//! The same path recovers a faulted replica, and re-registers a learner
//! with whichever node leads after a leader change.

use crate::error::SyncError;
use crate::replication::StateReplication;
use parking_lot::Mutex;
use sequencer_consensus::{RaftNode, RaftTransport, RpcRequest, RpcResponse, SyncRequest, SyncResponse};
use sequencer_types::NodeId;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Nodes to ask for a sync, in order
    pub peers: Vec<NodeId>,
    /// Bound on one attempt, from request to fully applied
    pub sync_timeout: Duration,
    /// Pause before retrying from scratch
    pub retry_backoff: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            sync_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(500),
        }
    }
}

pub struct NodeSynchronization {
    node_id: NodeId,
    config: SyncConfig,
    raft: Arc<RaftNode>,
    replication: Arc<StateReplication>,
    transport: Arc<dyn RaftTransport>,
    /// Nodes the leader is currently pushing to
    pushing: Mutex<HashSet<NodeId>>,
    synced: AtomicBool,
}

impl NodeSynchronization {
    pub fn new(
        config: SyncConfig,
        raft: Arc<RaftNode>,
        replication: Arc<StateReplication>,
        transport: Arc<dyn RaftTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: raft.node_id(),
            config,
            raft,
            replication,
            transport,
            pushing: Mutex::new(HashSet::new()),
            synced: AtomicBool::new(false),
        })
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    // === Leader side ===

    /// Acknowledge a sync request and push the snapshot in the background
    pub fn handle_sync_request(self: &Arc<Self>, req: &SyncRequest) -> SyncResponse {
        if !self.raft.is_leader() {
            tracing::debug!(
                "Node {} got sync request from {} but is not leader",
                self.node_id,
                req.node_id
            );
            return SyncResponse {
                success: false,
                leader_hint: self.raft.leader_id(),
            };
        }

        if self.pushing.lock().insert(req.node_id) {
            let sync = self.clone();
            let target = req.node_id;
            tokio::spawn(async move {
                if let Err(e) = sync.push_snapshot(target).await {
                    tracing::warn!("Snapshot push to node {} failed: {}", target, e);
                }
                sync.pushing.lock().remove(&target);
            });
        }

        SyncResponse {
            success: true,
            leader_hint: Some(self.node_id),
        }
    }

    async fn push_snapshot(&self, target: NodeId) -> Result<(), SyncError> {
        let snapshot = self.replication.snapshot()?;
        let index = snapshot.last_included_index;
        tracing::info!(
            "Node {} pushing snapshot through {} to node {}",
            self.node_id,
            index,
            target
        );
        if self.raft.install_snapshot_on(target, snapshot).await? {
            tracing::info!("Node {} synced through index {}", target, index);
        }
        Ok(())
    }

    // === Joining side ===

    /// Join first when `join` is set, then keep this node synced for as long
    /// as it runs
    pub async fn run(&self, join: bool) {
        if join {
            self.join_cluster().await;
        }

        let config = self.raft.config();
        let window = config.election_timeout_max;
        let mut ticker = tokio::time::interval(config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if self.replication.is_faulted() {
                tracing::warn!("Node {} replica faulted, syncing from the leader", self.node_id);
                self.sync_until_caught_up().await;
                self.raft.set_participating(true);
            } else if self.raft.leader_silent(window) {
                tracing::info!(
                    "Node {} heard no leader for {:?}, asking to be synced again",
                    self.node_id,
                    window
                );
                self.sync_until_caught_up().await;
            }
        }
    }

    /// Sync from the leader, retrying from scratch until it succeeds, then
    /// start participating in consensus
    pub async fn join_cluster(&self) {
        self.sync_until_caught_up().await;
        self.raft.set_participating(true);
        self.synced.store(true, Ordering::SeqCst);
    }

    async fn sync_until_caught_up(&self) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.try_sync().await {
                Ok(index) => {
                    tracing::info!(
                        "Node {} synchronized at index {} after {} attempt(s)",
                        self.node_id,
                        index,
                        attempt
                    );
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Node {} sync attempt {} failed: {}, retrying in {:?}",
                        self.node_id,
                        attempt,
                        e,
                        self.config.retry_backoff
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }

    /// One sync attempt. Returns the applied index once caught up.
    pub async fn try_sync(&self) -> Result<u64, SyncError> {
        // Registered before asking, so an install from an earlier attempt does not count
        let installed = self.raft.snapshot_installed().notified();
        let leader = self.request_sync().await?;
        let timeout = self.config.sync_timeout;
        let timed_out = || SyncError::Timeout {
            leader,
            waited_ms: timeout.as_millis() as u64,
        };

        tokio::time::timeout(timeout, installed)
            .await
            .map_err(|_| timed_out())?;

        let target = self.raft.commit_index();
        let mut applied = self.replication.watch_applied();
        let caught_up = |&index: &u64| index >= target && !self.replication.is_faulted();
        tokio::time::timeout(timeout, applied.wait_for(caught_up))
            .await
            .map_err(|_| timed_out())?
            .map_err(|_| timed_out())?;

        Ok(self.replication.last_applied_index())
    }

    /// Find a node that accepts the request, following leader hints
    async fn request_sync(&self) -> Result<NodeId, SyncError> {
        let mut candidates: VecDeque<NodeId> = self
            .config
            .peers
            .iter()
            .copied()
            .filter(|&p| p != self.node_id)
            .collect();
        let mut budget = candidates.len() * 2;

        while let Some(target) = candidates.pop_front() {
            if budget == 0 {
                break;
            }
            budget -= 1;

            let request = RpcRequest::Sync(SyncRequest {
                node_id: self.node_id,
            });
            let response = tokio::time::timeout(self.config.sync_timeout, self.transport.send(target, request)).await;
            match response {
                Ok(Ok(RpcResponse::Sync(SyncResponse { success: true, .. }))) => {
                    tracing::info!("Node {} sync accepted by node {}", self.node_id, target);
                    return Ok(target);
                }
                Ok(Ok(RpcResponse::Sync(SyncResponse {
                    success: false,
                    leader_hint: Some(hint),
                }))) if hint != self.node_id && hint != target => {
                    tracing::debug!("Node {} redirected to leader {}", target, hint);
                    candidates.push_front(hint);
                }
                Ok(Ok(other)) => {
                    tracing::debug!("Node {} declined sync: {:?}", target, other);
                }
                Ok(Err(e)) => {
                    tracing::debug!("Sync request to node {} failed: {}", target, e);
                }
                Err(_) => {
                    tracing::debug!("Sync request to node {} timed out", target);
                }
            }
        }
        Err(SyncError::NoLeader)
    }
}
