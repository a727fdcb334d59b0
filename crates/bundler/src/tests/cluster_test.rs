//! Multi-node sequencer tests
//!
//! Drives whole sequencer nodes over an in-process network:
//! - Ordering and replication of submitted transactions
//! - Leader isolation and `NoLeaderAvailable`
//! - A fourth node joining through snapshot sync, across leader changes
//! - Bundles reaching settlement

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use sequencer_consensus::{LocalNetwork, RaftConfig, RpcHandler};
use sequencer_state::SyncConfig;
use sequencer_types::{AccountId, NodeId, Transaction, TRANSFER_GAS};
use tokio::time::Instant;

use crate::{
    BundlerConfig, DistributedSequencer, LoggingSubmitter, SequencerError, TransactionReceipt,
    TxStatus,
};

fn alice() -> SigningKey {
    SigningKey::from_bytes(&[1; 32])
}

fn bob() -> AccountId {
    AccountId::from(&SigningKey::from_bytes(&[2; 32]))
}

fn transfer(nonce: u64) -> Transaction {
    Transaction::new_signed(&alice(), bob(), 10, nonce, 1, TRANSFER_GAS)
}

struct Cluster {
    network: LocalNetwork,
    nodes: Vec<Arc<DistributedSequencer>>,
    handlers: Vec<Arc<dyn RpcHandler>>,
    submitter: Arc<LoggingSubmitter>,
}

impl Cluster {
    fn new(ids: &[NodeId]) -> Self {
        let mut cluster = Cluster {
            network: LocalNetwork::new(),
            nodes: Vec::new(),
            handlers: Vec::new(),
            submitter: Arc::new(LoggingSubmitter::new()),
        };
        for &id in ids {
            let peers = ids.iter().copied().filter(|&p| p != id).collect();
            cluster.add_node(id, peers, false);
        }
        cluster
    }

    fn add_node(&mut self, id: NodeId, peers: Vec<NodeId>, join: bool) -> Arc<DistributedSequencer> {
        let node = DistributedSequencer::builder()
            .raft_config(RaftConfig {
                node_id: id,
                peers: peers.clone(),
                election_timeout_min: Duration::from_millis(150),
                election_timeout_max: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(30),
                rpc_timeout: Duration::from_millis(200),
                ..RaftConfig::default()
            })
            .bundler_config(BundlerConfig {
                min_transactions_to_finalize: 5,
                max_bundle_age: Duration::from_millis(200),
                tick_interval: Duration::from_millis(20),
                ..BundlerConfig::default()
            })
            .sync_config(SyncConfig {
                peers,
                sync_timeout: Duration::from_secs(2),
                retry_backoff: Duration::from_millis(100),
            })
            .genesis(vec![(AccountId::from(&alice()), 1_000_000)])
            .snapshot_interval(0)
            .join(join)
            .transport(self.network.transport_for(id))
            .submitter(self.submitter.clone())
            .build()
            .unwrap();

        let handler: Arc<dyn RpcHandler> = node.clone();
        self.network.register(id, Arc::downgrade(&handler));
        self.handlers.push(handler);
        node.start().unwrap();
        self.nodes.push(node.clone());
        node
    }

    fn node(&self, id: NodeId) -> &Arc<DistributedSequencer> {
        self.nodes.iter().find(|n| n.node_id() == id).unwrap()
    }

    fn leader(&self) -> Option<&Arc<DistributedSequencer>> {
        self.nodes.iter().find(|n| n.is_leader())
    }

    /// Wait until a leader exists and every other node follows it
    async fn stable_leader(&self) -> Arc<DistributedSequencer> {
        wait_for("a stable leader", || {
            self.leader().is_some_and(|leader| {
                self.nodes
                    .iter()
                    .all(|n| n.leader_id() == Some(leader.node_id()))
            })
        })
        .await;
        self.leader().unwrap().clone()
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Submit through whichever node currently leads, riding out elections
async fn submit(cluster: &Cluster, tx: &Transaction) -> TransactionReceipt {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let leader = cluster.stable_leader().await;
        match leader.process_transaction(tx.clone()).await {
            Ok(receipt) => return receipt,
            Err(SequencerError::NoLeaderAvailable) if Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("submission failed: {:?}", e),
        }
    }
}

fn pending_index(status: &TxStatus) -> u64 {
    match status {
        TxStatus::Pending { index, .. } => *index,
        other => panic!("expected a pending receipt, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transactions_commit_in_same_order_everywhere() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.stable_leader().await;

    let mut receipts = Vec::new();
    for nonce in 0..10 {
        // Spread submissions so followers forward to the leader
        let entry = &cluster.nodes[nonce as usize % cluster.nodes.len()];
        receipts.push(entry.process_transaction(transfer(nonce)).await.unwrap());
    }
    let last = receipts.iter().map(|r| pending_index(&r.status)).max().unwrap();
    wait_for("every node to apply all transactions", || {
        cluster.nodes.iter().all(|n| n.last_applied_index() >= last)
    })
    .await;

    let mut indexes: Vec<u64> = receipts.iter().map(|r| pending_index(&r.status)).collect();
    let in_order = indexes.windows(2).all(|w| w[0] < w[1]);
    assert!(in_order, "receipts out of order: {:?}", indexes);
    indexes.dedup();
    assert_eq!(indexes.len(), 10);

    let root = leader.replication().state_root().unwrap();
    for node in &cluster.nodes {
        assert_eq!(node.replication().state_root().unwrap(), root);
        assert_eq!(node.replication().nonce(&AccountId::from(&alice())), 10);
        assert_eq!(node.replication().balance(&bob()), 100);
    }

    // Followers see every transaction at the index the leader assigned
    let followers: Vec<_> = cluster.nodes.iter().filter(|n| !n.is_leader()).collect();
    wait_for("followers to account every transaction", || {
        followers.iter().all(|node| {
            receipts.iter().all(|receipt| {
                node.transaction_status(&receipt.id)
                    == Some(TxStatus::Applied {
                        index: pending_index(&receipt.status),
                    })
            })
        })
    })
    .await;
    assert!(cluster.nodes.iter().any(|n| n.stats().transactions_forwarded > 0));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_stops_accepting() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let old = cluster.stable_leader().await;
    let old_term = old.raft().current_term();
    cluster.network.isolate(old.node_id());

    wait_for("a new leader in a later term", || {
        cluster
            .nodes
            .iter()
            .any(|n| n.node_id() != old.node_id() && n.is_leader() && n.raft().current_term() > old_term)
    })
    .await;
    wait_for("the isolated leader to step down", || !old.is_leader()).await;

    let err = old.process_transaction(transfer(0)).await.unwrap_err();
    assert!(matches!(err, SequencerError::NoLeaderAvailable), "got {:?}", err);

    cluster.network.heal();
    let leader = cluster.stable_leader().await;
    assert!(leader.raft().current_term() > old_term);
    let receipt = old.process_transaction(transfer(0)).await.unwrap();
    assert_eq!(receipt.leader, leader.node_id());
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joining_node_syncs_then_follows() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.stable_leader().await;
    for nonce in 0..5 {
        leader.process_transaction(transfer(nonce)).await.unwrap();
    }
    wait_for("the leader to apply its writes", || {
        leader.last_applied_index() == leader.raft().commit_index()
            && leader.replication().nonce(&AccountId::from(&alice())) == 5
    })
    .await;
    let at_join = leader.last_applied_index();

    let joiner = cluster.add_node(4, vec![1, 2, 3], true);
    wait_for("the new node to sync", || joiner.is_synced()).await;
    assert!(joiner.last_applied_index() >= at_join);
    assert_eq!(
        joiner.replication().state_root().unwrap(),
        leader.replication().state_root().unwrap()
    );

    for nonce in 5..8 {
        leader.process_transaction(transfer(nonce)).await.unwrap();
    }
    wait_for("the new node to follow new commits", || {
        joiner.replication().nonce(&AccountId::from(&alice())) == 8
            && joiner.last_applied_index() == leader.last_applied_index()
    })
    .await;
    assert_eq!(
        joiner.replication().state_root().unwrap(),
        leader.replication().state_root().unwrap()
    );
    assert_eq!(cluster.node(4).leader_id(), Some(leader.node_id()));
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joined_node_follows_new_leader() {
    let mut cluster = Cluster::new(&[1, 2, 3]);
    let old = cluster.stable_leader().await;
    let joiner = cluster.add_node(4, vec![1, 2, 3], true);
    wait_for("the new node to sync", || joiner.is_synced()).await;
    let old_term = old.raft().current_term();

    cluster.network.isolate(old.node_id());
    wait_for("a new leader in a later term", || {
        cluster
            .nodes
            .iter()
            .any(|n| n.node_id() != old.node_id() && n.is_leader() && n.raft().current_term() > old_term)
    })
    .await;
    cluster.network.heal();

    // Every node, the joined one included, settles on the new leader
    let leader = cluster.stable_leader().await;
    assert_ne!(leader.node_id(), joiner.node_id());

    for nonce in 0..10 {
        submit(&cluster, &transfer(nonce)).await;
    }
    wait_for("the joined node to follow the new leader", || {
        let leader = cluster.leader();
        joiner.replication().nonce(&AccountId::from(&alice())) == 10
            && leader.is_some_and(|l| joiner.last_applied_index() == l.last_applied_index())
    })
    .await;

    let leader = cluster.stable_leader().await;
    assert_eq!(
        joiner.replication().state_root().unwrap(),
        leader.replication().state_root().unwrap()
    );
    assert_eq!(joiner.raft().current_term(), leader.raft().current_term());
    assert_eq!(joiner.raft().stats().elections_started, 0);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_committed_transactions_reach_settlement() {
    let cluster = Cluster::new(&[1, 2, 3]);
    let leader = cluster.stable_leader().await;

    let txs: Vec<Transaction> = (0..6).map(transfer).collect();
    let mut ids = Vec::new();
    for tx in &txs {
        ids.push(leader.process_transaction(tx.clone()).await.unwrap().id);
    }
    wait_for("every transaction to settle", || {
        ids.iter()
            .all(|id| matches!(leader.transaction_status(id), Some(TxStatus::Settled { .. })))
    })
    .await;

    assert_eq!(cluster.submitter.settled_count(), 6);
    let stats = leader.stats().bundler;
    assert!(stats.bundles_confirmed >= 1);
    assert_eq!(stats.transactions_settled, 6);

    // Resubmitting a settled transaction returns its existing receipt
    let again = leader.process_transaction(txs[0].clone()).await.unwrap();
    assert!(matches!(again.status, TxStatus::Settled { .. }));
    cluster.shutdown();
}

#[tokio::test]
async fn test_invalid_transactions_rejected_up_front() {
    let cluster = Cluster::new(&[1]);
    let node = cluster.stable_leader().await;

    let mut tampered = transfer(0);
    tampered.amount = 1;
    assert!(matches!(
        node.process_transaction(tampered).await,
        Err(SequencerError::InvalidTransaction(_))
    ));

    let heavy = Transaction::new_signed(&alice(), bob(), 1, 0, 0, 40_000_000);
    assert!(matches!(
        node.process_transaction(heavy).await,
        Err(SequencerError::GasLimitExceeded { max: 30_000_000, .. })
    ));
    assert_eq!(node.stats().transactions_rejected, 2);
    cluster.shutdown();
}
