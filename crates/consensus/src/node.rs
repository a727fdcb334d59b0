//! Async consensus node
//!
//! Drives a [`RaftCore`] with timers and a transport: randomized election
//! timeouts, parallel vote collection, per-peer replication and heartbeats.
//! Committed entries leave through the apply channel in index order; role
//! changes leave through a broadcast channel.

use crate::error::{ConsensusError, TransportError};
use crate::raft::{Outbound, RaftCore};
use crate::rpc::{RequestVoteRequest, RpcRequest, RpcResponse};
use crate::storage::LogStorage;
use crate::transport::{RaftTransport, RpcHandler};
use crate::types::{ApplyMsg, ConsensusStats, EntryPayload, NodeRole, RaftConfig, RoleChange, Snapshot};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use sequencer_types::NodeId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub struct RaftNode {
    config: RaftConfig,
    core: Mutex<RaftCore>,
    transport: Arc<dyn RaftTransport>,
    apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    role_tx: broadcast::Sender<RoleChange>,
    /// Signalled after a leader's snapshot is installed
    snapshot_installed: Notify,
    /// Peers with a replication round in flight
    replicating: Mutex<HashSet<NodeId>>,
    shutdown: AtomicBool,
}

impl RaftNode {
    /// Restore the node from `storage`. Returns the node and the receiving
    /// end of its apply channel.
    pub fn new(
        config: RaftConfig,
        storage: Arc<dyn LogStorage>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ApplyMsg>), ConsensusError> {
        let core = RaftCore::new(&config, storage)?;
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (role_tx, _) = broadcast::channel(64);

        let node = Arc::new(Self {
            config,
            core: Mutex::new(core),
            transport,
            apply_tx,
            role_tx,
            snapshot_installed: Notify::new(),
            replicating: Mutex::new(HashSet::new()),
            shutdown: AtomicBool::new(false),
        });
        // A restored snapshot goes to the state machine first
        node.with_core(|_| ());
        Ok((node, apply_rx))
    }

    /// Run `f` on the core, then publish role changes and committed entries
    /// while still holding the lock so their order is preserved
    fn with_core<T>(&self, f: impl FnOnce(&mut RaftCore) -> T) -> T {
        let mut core = self.core.lock();
        let out = f(&mut core);
        for event in core.take_events() {
            tracing::debug!("Node {} role change: {:?}", self.config.node_id, event);
            let _ = self.role_tx.send(event);
        }
        for msg in core.take_apply() {
            if self.apply_tx.send(msg).is_err() {
                tracing::warn!("Apply channel closed on node {}", self.config.node_id);
            }
        }
        out
    }

    // === Accessors ===

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.core.lock().is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.core.lock().leader_id()
    }

    pub fn role(&self) -> NodeRole {
        self.core.lock().role()
    }

    pub fn current_term(&self) -> u64 {
        self.core.lock().current_term()
    }

    pub fn commit_index(&self) -> u64 {
        self.core.lock().commit_index()
    }

    pub fn last_log_index(&self) -> u64 {
        self.core.lock().log().last_index()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.core.lock().peers().to_vec()
    }

    pub fn stats(&self) -> ConsensusStats {
        self.core.lock().stats()
    }

    pub fn subscribe_roles(&self) -> broadcast::Receiver<RoleChange> {
        self.role_tx.subscribe()
    }

    /// Woken on every successful InstallSnapshot. Waiters must exist before
    /// the install; no permit is stored.
    pub fn snapshot_installed(&self) -> &Notify {
        &self.snapshot_installed
    }

    pub fn is_participating(&self) -> bool {
        self.core.lock().is_participating()
    }

    /// True for a learner that has heard no leader within `window`
    pub fn leader_silent(&self, window: Duration) -> bool {
        self.core.lock().leader_silent(Instant::now(), window)
    }

    /// Stop participating until a leader snapshot replaces local state
    pub fn begin_resync(&self) {
        self.with_core(|core| core.begin_resync());
        tracing::warn!("Node {} awaiting a snapshot to resync", self.config.node_id);
    }

    /// Let an observer accept AppendEntries; voters also vote and run elections
    pub fn set_participating(&self, participating: bool) {
        self.with_core(|core| core.set_participating(participating));
        tracing::info!(
            "Node {} participating in consensus: {}",
            self.config.node_id,
            participating
        );
    }

    pub fn compact(&self, snapshot: Snapshot) -> Result<(), ConsensusError> {
        self.with_core(|core| core.compact(snapshot))
    }

    // === Client path ===

    /// Append `payload` on the leader and start replicating it
    pub fn propose(self: &Arc<Self>, payload: EntryPayload) -> Result<(u64, u64), ConsensusError> {
        let position = self.with_core(|core| core.propose(payload))?;
        self.replicate_all();
        Ok(position)
    }

    // === Lifecycle ===

    /// Spawn the timer loop driving elections and heartbeats
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move { node.run_timers().await })
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let core = self.core.lock();
        if let Err(e) = core.log().storage().close() {
            tracing::warn!("Failed to close log storage: {}", e);
        }
    }

    fn random_election_timeout(&self) -> Duration {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = (self.config.election_timeout_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    async fn run_timers(self: Arc<Self>) {
        let tick = (self.config.heartbeat_interval / 3).max(Duration::from_millis(5));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut election_timeout = self.random_election_timeout();
        let mut last_broadcast = Instant::now();

        tracing::info!("Node {} consensus timers started", self.config.node_id);

        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let now = Instant::now();

            let (leader, election_due) = {
                let core = self.core.lock();
                (core.is_leader(), core.election_due(now, election_timeout))
            };

            if leader {
                if now.saturating_duration_since(last_broadcast) >= self.config.heartbeat_interval {
                    last_broadcast = now;
                    let window = self.config.election_timeout_max;
                    let still_leader = self.with_core(|core| core.check_quorum(now, window));
                    if still_leader {
                        self.replicate_all();
                    }
                }
            } else if election_due {
                election_timeout = self.random_election_timeout();
                let node = self.clone();
                let id = self.config.node_id;
                tokio::spawn(async move {
                    if let Err(e) = node.run_election().await {
                        tracing::error!("Election failed on node {}: {}", id, e);
                    }
                });
            }
        }

        tracing::info!("Node {} consensus timers stopped", self.config.node_id);
    }

    // === Elections ===

    async fn run_election(self: Arc<Self>) -> Result<(), ConsensusError> {
        let (request, peers) = self.with_core(|core| {
            core.start_election().map(|req| (req, core.peers().to_vec()))
        })?;
        if self.is_leader() {
            self.replicate_all();
            return Ok(());
        }

        let mut votes: FuturesUnordered<_> = peers
            .into_iter()
            .map(|peer| {
                let node = self.clone();
                let request = request.clone();
                async move { (peer, node.request_vote(peer, request).await) }
            })
            .collect();

        while let Some((peer, result)) = votes.next().await {
            match result {
                Ok(resp) => {
                    let became_leader = self.with_core(|core| {
                        core.handle_vote_response(peer, request.term, &resp)
                            .map(|_| core.is_leader())
                    })?;
                    if became_leader {
                        self.replicate_all();
                        return Ok(());
                    }
                    if self.current_term() != request.term || self.role() != NodeRole::Candidate {
                        return Ok(());
                    }
                }
                Err(e) => {
                    tracing::debug!("Vote request to node {} failed: {}", peer, e);
                }
            }
        }
        Ok(())
    }

    async fn request_vote(
        &self,
        peer: NodeId,
        request: RequestVoteRequest,
    ) -> Result<crate::rpc::RequestVoteResponse, TransportError> {
        match self.call(peer, RpcRequest::RequestVote(request)).await? {
            RpcResponse::RequestVote(resp) => Ok(resp),
            _ => Err(TransportError::UnexpectedResponse("RequestVote")),
        }
    }

    /// Send with the configured RPC timeout
    async fn call(&self, peer: NodeId, request: RpcRequest) -> Result<RpcResponse, TransportError> {
        tokio::time::timeout(self.config.rpc_timeout, self.transport.send(peer, request))
            .await
            .map_err(|_| TransportError::Timeout(peer))?
    }

    // === Replication ===

    /// Kick a replication round to every target that has none in flight
    pub fn replicate_all(self: &Arc<Self>) {
        let targets = self.core.lock().replication_targets();
        for peer in targets {
            if !self.replicating.lock().insert(peer) {
                continue;
            }
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(e) = node.replicate_to(peer).await {
                    tracing::debug!("Replication to node {} failed: {}", peer, e);
                }
                node.replicating.lock().remove(&peer);
            });
        }
    }

    async fn replicate_to(&self, peer: NodeId) -> Result<(), ConsensusError> {
        loop {
            let outbound = {
                let core = self.core.lock();
                if !core.is_leader() {
                    return Ok(());
                }
                core.outbound_for(peer)?
            };

            let more = match outbound {
                Outbound::Append(req) => {
                    let resp = match self.call(peer, RpcRequest::AppendEntries(req.clone())).await? {
                        RpcResponse::AppendEntries(resp) => resp,
                        _ => return Err(TransportError::UnexpectedResponse("AppendEntries").into()),
                    };
                    self.with_core(|core| core.handle_append_response(peer, &req, &resp))?
                }
                Outbound::Snapshot(req) => {
                    tracing::info!(
                        "Node {} is behind the compacted log, sending snapshot through {}",
                        peer,
                        req.snapshot.last_included_index
                    );
                    self.send_snapshot(peer, req).await?;
                    false
                }
            };
            if !more {
                return Ok(());
            }
        }
    }

    async fn send_snapshot(
        &self,
        peer: NodeId,
        req: crate::rpc::InstallSnapshotRequest,
    ) -> Result<bool, ConsensusError> {
        let resp = match self.call(peer, RpcRequest::InstallSnapshot(req.clone())).await? {
            RpcResponse::InstallSnapshot(resp) => resp,
            _ => return Err(TransportError::UnexpectedResponse("InstallSnapshot").into()),
        };
        self.with_core(|core| core.handle_snapshot_response(peer, &req, &resp))
    }

    /// Push `snapshot` plus the log after it to `target`. On success a node
    /// that is not a voter is registered as a learner.
    pub async fn install_snapshot_on(
        &self,
        target: NodeId,
        snapshot: Snapshot,
    ) -> Result<bool, ConsensusError> {
        let req = {
            let core = self.core.lock();
            if !core.is_leader() {
                return Err(ConsensusError::NotLeader {
                    leader_hint: core.leader_id(),
                });
            }
            core.snapshot_request(snapshot)
        };
        let installed = self.send_snapshot(target, req).await?;
        if installed {
            self.with_core(|core| {
                let matched = core.match_index_of(target);
                core.add_learner(target, matched);
            });
        }
        Ok(installed)
    }

    // === Inbound ===

    /// Serve consensus RPCs; other requests are left to the caller
    pub fn handle_consensus_rpc(&self, request: &RpcRequest) -> Option<RpcResponse> {
        let result = match request {
            RpcRequest::RequestVote(req) => self
                .with_core(|core| core.handle_request_vote(req))
                .map(RpcResponse::RequestVote),
            RpcRequest::AppendEntries(req) => self
                .with_core(|core| core.handle_append_entries(req))
                .map(RpcResponse::AppendEntries),
            RpcRequest::InstallSnapshot(req) => {
                let result = self.with_core(|core| core.handle_install_snapshot(req));
                if matches!(&result, Ok(resp) if resp.success) {
                    self.snapshot_installed.notify_waiters();
                }
                result.map(RpcResponse::InstallSnapshot)
            }
            RpcRequest::ForwardTransaction(_) | RpcRequest::Sync(_) => return None,
        };

        Some(result.unwrap_or_else(|e| {
            tracing::error!(
                "Node {} failed to handle {}: {}",
                self.config.node_id,
                request.kind(),
                e
            );
            RpcResponse::Error(e.to_string())
        }))
    }
}

#[async_trait]
impl RpcHandler for RaftNode {
    async fn handle(&self, _from: NodeId, request: RpcRequest) -> RpcResponse {
        self.handle_consensus_rpc(&request)
            .unwrap_or_else(|| RpcResponse::Error(format!("{} not served here", request.kind())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStorage;
    use crate::transport::LocalNetwork;
    use sequencer_types::{AccountId, Transaction, TRANSFER_GAS};

    struct TestCluster {
        network: LocalNetwork,
        nodes: Vec<Arc<RaftNode>>,
        applied: Vec<Arc<Mutex<Vec<u64>>>>,
    }

    fn fast_config(id: NodeId, ids: &[NodeId]) -> RaftConfig {
        RaftConfig {
            node_id: id,
            peers: ids.iter().copied().filter(|&p| p != id).collect(),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(30),
            rpc_timeout: Duration::from_millis(100),
            ..RaftConfig::default()
        }
    }

    async fn cluster(ids: &[NodeId]) -> TestCluster {
        let network = LocalNetwork::new();
        let mut nodes = Vec::new();
        let mut applied = Vec::new();
        for &id in ids {
            let (node, mut rx) = RaftNode::new(
                fast_config(id, ids),
                Arc::new(MemoryLogStorage::new()),
                network.transport_for(id),
            )
            .unwrap();
            let handler: Arc<dyn RpcHandler> = node.clone();
            network.register(id, Arc::downgrade(&handler));
            node.start();

            let log = Arc::new(Mutex::new(Vec::new()));
            let sink = log.clone();
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let ApplyMsg::Entries(entries) = msg {
                        sink.lock().extend(entries.iter().map(|e| e.index));
                    }
                }
            });
            nodes.push(node);
            applied.push(log);
        }
        TestCluster { network, nodes, applied }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn leaders(nodes: &[Arc<RaftNode>]) -> Vec<NodeId> {
        nodes.iter().filter(|n| n.is_leader()).map(|n| n.node_id()).collect()
    }

    fn transfer(nonce: u64) -> EntryPayload {
        let key = ed25519_dalek::SigningKey::from_bytes(&[3; 32]);
        EntryPayload::Transaction(Transaction::signed_at(
            &key,
            AccountId::new([4; 32]),
            1,
            nonce,
            0,
            TRANSFER_GAS,
            0,
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_elects_single_leader_and_replicates() {
        let c = cluster(&[1, 2, 3]).await;
        wait_for("a leader", || leaders(&c.nodes).len() == 1).await;

        let leader_id = leaders(&c.nodes)[0];
        let leader = c.nodes.iter().find(|n| n.node_id() == leader_id).unwrap();
        for nonce in 0..5 {
            leader.propose(transfer(nonce)).unwrap();
        }
        let target = leader.last_log_index();

        wait_for("all nodes to apply", || {
            c.applied.iter().all(|a| a.lock().last() == Some(&target))
        })
        .await;
        let expected: Vec<u64> = (1..=target).collect();
        for applied in &c.applied {
            assert_eq!(*applied.lock(), expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_isolated_leader_steps_down() {
        let c = cluster(&[1, 2, 3]).await;
        wait_for("a leader", || leaders(&c.nodes).len() == 1).await;
        let old = leaders(&c.nodes)[0];
        let old_node = c.nodes.iter().find(|n| n.node_id() == old).unwrap().clone();
        let mut roles = old_node.subscribe_roles();

        c.network.isolate(old);

        wait_for("a new leader", || {
            c.nodes
                .iter()
                .any(|n| n.node_id() != old && n.is_leader())
        })
        .await;
        wait_for("old leader to step down", || !old_node.is_leader()).await;
        assert!(matches!(
            old_node.propose(transfer(0)),
            Err(ConsensusError::NotLeader { .. })
        ));

        let change = roles.recv().await.unwrap();
        assert!(matches!(change, RoleChange::BecameFollower { leader_id: None, .. }));
    }
}
