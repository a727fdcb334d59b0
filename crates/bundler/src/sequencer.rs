//! Distributed sequencer
//!
//! Wires consensus, state replication, node synchronization and the bundler
//! of one node together and serves its inbound RPCs. Transactions submitted
//! to a follower are forwarded to the leader.

use crate::bundler::{BundlerConfig, BundlerStats, TransactionBundler, TxStatus};
use crate::error::SequencerError;
use crate::settlement::{
    AlertSink, BundleSigner, Ed25519Signer, FixedGasOracle, GasPriceOracle, LogAlertSink,
    LoggingSubmitter, SettlementSubmitter,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use sequencer_consensus::{
    ApplyMsg, ConsensusError, ConsensusStats, EntryPayload, ForwardStatus, ForwardTransactionRequest,
    ForwardTransactionResponse, LogStorage, MemoryLogStorage, RaftConfig, RaftNode, RaftTransport,
    RpcHandler, RpcRequest, RpcResponse,
};
use sequencer_state::{NodeSynchronization, StateReplication, SyncConfig, DEFAULT_SNAPSHOT_INTERVAL};
use sequencer_types::{AccountId, Amount, NodeId, Transaction, TransactionId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a client gets back for a submitted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionReceipt {
    pub id: TransactionId,
    pub status: TxStatus,
    /// Node that accepted it into the log
    pub leader: NodeId,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SequencerStats {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub synced: bool,
    pub last_applied_index: u64,
    pub transactions_received: u64,
    pub transactions_forwarded: u64,
    pub transactions_rejected: u64,
    pub consensus: ConsensusStats,
    pub bundler: BundlerStats,
}

/// Builder for DistributedSequencer
pub struct SequencerBuilder {
    raft: RaftConfig,
    bundler: BundlerConfig,
    sync: SyncConfig,
    genesis: Vec<(AccountId, Amount)>,
    snapshot_interval: u64,
    join: bool,
    storage: Option<Arc<dyn LogStorage>>,
    transport: Option<Arc<dyn RaftTransport>>,
    submitter: Option<Arc<dyn SettlementSubmitter>>,
    oracle: Option<Arc<dyn GasPriceOracle>>,
    signer: Option<Arc<dyn BundleSigner>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl SequencerBuilder {
    pub fn new() -> Self {
        Self {
            raft: RaftConfig::default(),
            bundler: BundlerConfig::default(),
            sync: SyncConfig::default(),
            genesis: Vec::new(),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            join: false,
            storage: None,
            transport: None,
            submitter: None,
            oracle: None,
            signer: None,
            alerts: None,
        }
    }

    pub fn raft_config(mut self, config: RaftConfig) -> Self {
        self.raft = config;
        self
    }

    pub fn bundler_config(mut self, config: BundlerConfig) -> Self {
        self.bundler = config;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync = config;
        self
    }

    pub fn genesis(mut self, balances: Vec<(AccountId, Amount)>) -> Self {
        self.genesis = balances;
        self
    }

    pub fn snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Start as an observer and sync from the leader before participating
    pub fn join(mut self, join: bool) -> Self {
        self.join = join;
        self
    }

    pub fn storage(mut self, storage: Arc<dyn LogStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RaftTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn submitter(mut self, submitter: Arc<dyn SettlementSubmitter>) -> Self {
        self.submitter = Some(submitter);
        self
    }

    pub fn gas_oracle(mut self, oracle: Arc<dyn GasPriceOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn signer(mut self, signer: Arc<dyn BundleSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn build(self) -> Result<Arc<DistributedSequencer>, SequencerError> {
        let transport = self
            .transport
            .ok_or_else(|| SequencerError::Config("a transport is required".to_string()))?;
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryLogStorage::new()));
        let node_id = self.raft.node_id;

        let mut raft_config = self.raft;
        raft_config.join_as_observer = self.join;
        let (raft, apply_rx) = RaftNode::new(raft_config, storage, transport.clone())?;
        let replication = StateReplication::new(raft.clone(), &self.genesis, self.snapshot_interval);

        let mut sync_config = self.sync;
        if sync_config.peers.is_empty() {
            sync_config.peers = raft.peers();
        }
        let sync = NodeSynchronization::new(sync_config, raft.clone(), replication.clone(), transport.clone());

        let bundler = Arc::new(TransactionBundler::new(
            node_id,
            self.bundler,
            self.submitter
                .unwrap_or_else(|| Arc::new(LoggingSubmitter::new())),
            self.oracle.unwrap_or_else(|| Arc::new(FixedGasOracle::default())),
            self.signer.unwrap_or_else(|| Arc::new(Ed25519Signer::generate())),
            self.alerts.unwrap_or_else(|| Arc::new(LogAlertSink)),
        ));

        Ok(Arc::new(DistributedSequencer {
            node_id,
            join: self.join,
            raft,
            replication,
            sync,
            bundler,
            transport,
            apply_rx: Mutex::new(Some(apply_rx)),
            tasks: Mutex::new(Vec::new()),
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }))
    }
}

impl Default for SequencerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct DistributedSequencer {
    node_id: NodeId,
    join: bool,
    raft: Arc<RaftNode>,
    replication: Arc<StateReplication>,
    sync: Arc<NodeSynchronization>,
    bundler: Arc<TransactionBundler>,
    transport: Arc<dyn RaftTransport>,
    apply_rx: Mutex<Option<mpsc::UnboundedReceiver<ApplyMsg>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    received: AtomicU64,
    forwarded: AtomicU64,
    rejected: AtomicU64,
}

impl DistributedSequencer {
    pub fn builder() -> SequencerBuilder {
        SequencerBuilder::new()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn replication(&self) -> &Arc<StateReplication> {
        &self.replication
    }

    pub fn bundler(&self) -> &Arc<TransactionBundler> {
        &self.bundler
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.leader_id()
    }

    pub fn last_applied_index(&self) -> u64 {
        self.replication.last_applied_index()
    }

    pub fn is_synced(&self) -> bool {
        !self.join || self.sync.is_synced()
    }

    pub fn transaction_status(&self, id: &TransactionId) -> Option<TxStatus> {
        self.bundler.status(id)
    }

    pub fn stats(&self) -> SequencerStats {
        SequencerStats {
            node_id: self.node_id,
            is_leader: self.raft.is_leader(),
            synced: self.is_synced(),
            last_applied_index: self.replication.last_applied_index(),
            transactions_received: self.received.load(Ordering::Relaxed),
            transactions_forwarded: self.forwarded.load(Ordering::Relaxed),
            transactions_rejected: self.rejected.load(Ordering::Relaxed),
            consensus: self.raft.stats(),
            bundler: self.bundler.stats(),
        }
    }

    // === Lifecycle ===

    /// Spawn every per-node task. A joining node syncs before it participates;
    /// every node resyncs when its replica faults.
    pub fn start(self: &Arc<Self>) -> Result<(), SequencerError> {
        let apply_rx = self
            .apply_rx
            .lock()
            .take()
            .ok_or_else(|| SequencerError::Config("sequencer already started".to_string()))?;

        let mut tasks = self.replication.start(apply_rx);
        let roles = self.replication.subscribe_roles();
        let feed = self.replication.applied_feed();
        tasks.push(tokio::spawn(self.bundler.clone().run(roles, feed)));
        tasks.push(self.raft.start());

        let sync = self.sync.clone();
        let join = self.join;
        tasks.push(tokio::spawn(async move { sync.run(join).await }));
        self.tasks.lock().extend(tasks);

        tracing::info!(
            "Sequencer node {} started (peers {:?}, joining: {})",
            self.node_id,
            self.raft.peers(),
            self.join
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        self.raft.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!("Sequencer node {} stopped", self.node_id);
    }

    // === Client path ===

    fn validate(&self, tx: &Transaction) -> Result<(), SequencerError> {
        tx.verify()?;
        let max = self.bundler.config().max_gas_per_bundle;
        if tx.gas_limit > max {
            return Err(SequencerError::GasLimitExceeded {
                gas_limit: tx.gas_limit,
                max,
            });
        }
        Ok(())
    }

    /// Accept a client transaction on any node
    pub async fn process_transaction(&self, tx: Transaction) -> Result<TransactionReceipt, SequencerError> {
        self.received.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.validate(&tx) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Node {} rejected transaction {}: {}", self.node_id, tx.id, e);
            return Err(e);
        }

        if let Some(status) = self.bundler.status(&tx.id) {
            return Ok(TransactionReceipt {
                id: tx.id,
                status,
                leader: self.raft.leader_id().unwrap_or(self.node_id),
            });
        }

        if self.raft.is_leader() {
            return self.propose(tx);
        }
        match self.raft.leader_id() {
            Some(leader) if leader != self.node_id => self.forward_transaction_to_leader(leader, tx).await,
            _ => Err(SequencerError::NoLeaderAvailable),
        }
    }

    fn propose(&self, tx: Transaction) -> Result<TransactionReceipt, SequencerError> {
        let id = tx.id;
        let (index, term) = match self.raft.propose(EntryPayload::Transaction(tx)) {
            Ok(position) => position,
            Err(ConsensusError::NotLeader { .. }) => return Err(SequencerError::NoLeaderAvailable),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!("Node {} proposed transaction {} at {}/{}", self.node_id, id, index, term);
        Ok(TransactionReceipt {
            id,
            status: self.bundler.record_pending(id, index, term),
            leader: self.node_id,
        })
    }

    /// Hand a transaction to the leader and relay its answer
    pub async fn forward_transaction_to_leader(
        &self,
        leader: NodeId,
        tx: Transaction,
    ) -> Result<TransactionReceipt, SequencerError> {
        let id = tx.id;
        let request = RpcRequest::ForwardTransaction(ForwardTransactionRequest {
            leader_id: leader,
            transaction: tx,
        });
        let timeout = self.raft.config().rpc_timeout;
        let response = match tokio::time::timeout(timeout, self.transport.send(leader, request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!("Node {} could not forward {} to leader {}: {}", self.node_id, id, leader, e);
                return Err(SequencerError::NoLeaderAvailable);
            }
            Err(_) => {
                tracing::warn!("Node {} forward of {} to leader {} timed out", self.node_id, id, leader);
                return Err(SequencerError::NoLeaderAvailable);
            }
        };

        let status = match response {
            RpcResponse::ForwardTransaction(ForwardTransactionResponse { status, .. }) => status,
            other => {
                tracing::warn!("Node {} got unexpected forward response: {:?}", self.node_id, other);
                return Err(SequencerError::NoLeaderAvailable);
            }
        };
        let status = match status {
            ForwardStatus::Pending { index, term } => TxStatus::Pending { index, term },
            ForwardStatus::Duplicate => self
                .bundler
                .status(&id)
                .unwrap_or(TxStatus::Forwarded { leader }),
            ForwardStatus::Rejected(reason) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(SequencerError::Rejected(reason));
            }
            ForwardStatus::NotLeader { leader_hint } => {
                tracing::debug!(
                    "Node {} forwarded to {} which is not leader (hint {:?})",
                    self.node_id,
                    leader,
                    leader_hint
                );
                return Err(SequencerError::NoLeaderAvailable);
            }
        };
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(TransactionReceipt { id, status, leader })
    }

    /// Leader side of a forwarded transaction
    pub fn handle_forward(&self, from: NodeId, req: ForwardTransactionRequest) -> ForwardTransactionResponse {
        let id = req.transaction.id;
        if !self.raft.is_leader() {
            return ForwardTransactionResponse {
                id,
                status: ForwardStatus::NotLeader {
                    leader_hint: self.raft.leader_id(),
                },
            };
        }
        self.received.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.validate(&req.transaction) {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return ForwardTransactionResponse {
                id,
                status: ForwardStatus::Rejected(e.to_string()),
            };
        }
        if self.bundler.status(&id).is_some() {
            return ForwardTransactionResponse {
                id,
                status: ForwardStatus::Duplicate,
            };
        }

        let status = match self.propose(req.transaction) {
            Ok(TransactionReceipt {
                status: TxStatus::Pending { index, term },
                ..
            }) => ForwardStatus::Pending { index, term },
            Ok(_) => ForwardStatus::Duplicate,
            Err(SequencerError::NoLeaderAvailable) => ForwardStatus::NotLeader {
                leader_hint: self.raft.leader_id(),
            },
            Err(e) => ForwardStatus::Rejected(e.to_string()),
        };
        tracing::debug!("Node {} accepted forwarded {} from {}: {:?}", self.node_id, id, from, status);
        ForwardTransactionResponse { id, status }
    }
}

#[async_trait]
impl RpcHandler for DistributedSequencer {
    async fn handle(&self, from: NodeId, request: RpcRequest) -> RpcResponse {
        if let Some(response) = self.raft.handle_consensus_rpc(&request) {
            return response;
        }
        match request {
            RpcRequest::ForwardTransaction(req) => RpcResponse::ForwardTransaction(self.handle_forward(from, req)),
            RpcRequest::Sync(req) => RpcResponse::Sync(self.sync.handle_sync_request(&req)),
            other => RpcResponse::Error(format!("unsupported request {}", other.kind())),
        }
    }
}
