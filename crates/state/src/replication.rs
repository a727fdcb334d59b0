//! State replication
//!
//! Consumes the consensus apply channel and applies committed entries to
//! the [`StateStore`] strictly in index order. Applied transactions are
//! published on a crossbeam feed; role changes are republished after the
//! replica has switched its own mode.
//!
//! A failed apply leaves the replica faulted: it drops further entries and
//! consensus stops participating until a leader snapshot replaces the state.

use crate::error::ReplicationError;
use crate::state_store::{ApplyOutcome, StateSnapshot, StateStore};
use parking_lot::Mutex;
use sequencer_consensus::{ApplyMsg, LogEntry, EntryPayload, RaftNode, RoleChange, Snapshot};
use sequencer_types::{AccountId, Amount, NodeId, Transaction};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Event emitted for every applied transaction entry
#[derive(Debug, Clone)]
pub struct AppliedTransaction {
    pub index: u64,
    pub term: u64,
    pub transaction: Transaction,
    pub outcome: ApplyOutcome,
}

pub struct StateReplication {
    node_id: NodeId,
    store: StateStore,
    raft: Arc<RaftNode>,
    /// Applied entries between snapshots (0 disables)
    snapshot_interval: u64,
    last_snapshot_index: Mutex<u64>,
    leading: AtomicBool,
    faulted: AtomicBool,
    applied_tx: crossbeam_channel::Sender<AppliedTransaction>,
    applied_rx: crossbeam_channel::Receiver<AppliedTransaction>,
    applied_index: watch::Sender<u64>,
    role_tx: broadcast::Sender<RoleChange>,
    raft_roles: Mutex<Option<broadcast::Receiver<RoleChange>>>,
}

impl StateReplication {
    pub fn new(
        raft: Arc<RaftNode>,
        genesis: &[(AccountId, Amount)],
        snapshot_interval: u64,
    ) -> Arc<Self> {
        let (applied_tx, applied_rx) = crossbeam_channel::unbounded();
        let (applied_index, _) = watch::channel(0);
        let (role_tx, _) = broadcast::channel(64);
        let raft_roles = raft.subscribe_roles();

        Arc::new(Self {
            node_id: raft.node_id(),
            store: StateStore::new(genesis),
            raft,
            snapshot_interval,
            last_snapshot_index: Mutex::new(0),
            leading: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            applied_tx,
            applied_rx,
            applied_index,
            role_tx,
            raft_roles: Mutex::new(Some(raft_roles)),
        })
    }

    // === Read-only accessors ===

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn balance(&self, account: &AccountId) -> Amount {
        self.store.balance(account)
    }

    pub fn nonce(&self, account: &AccountId) -> u64 {
        self.store.nonce(account)
    }

    pub fn last_applied_index(&self) -> u64 {
        self.store.last_applied_index()
    }

    pub fn state_root(&self) -> Result<[u8; 32], ReplicationError> {
        self.store.state_root()
    }

    pub fn state_snapshot(&self) -> StateSnapshot {
        self.store.snapshot()
    }

    pub fn is_leader(&self) -> bool {
        self.leading.load(Ordering::SeqCst)
    }

    /// An apply failed and the replica is waiting for a fresh snapshot
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Feed of applied transactions (each event is delivered to one receiver)
    pub fn applied_feed(&self) -> crossbeam_channel::Receiver<AppliedTransaction> {
        self.applied_rx.clone()
    }

    /// Watch the last applied index
    pub fn watch_applied(&self) -> watch::Receiver<u64> {
        self.applied_index.subscribe()
    }

    /// Role changes, republished once this replica has switched mode
    pub fn subscribe_roles(&self) -> broadcast::Receiver<RoleChange> {
        self.role_tx.subscribe()
    }

    // === Apply path ===

    /// Apply one committed entry. Entries at or below the watermark are
    /// ignored; a gap is an error.
    pub fn apply(&self, entry: &LogEntry) -> Result<Option<AppliedTransaction>, ReplicationError> {
        let last = self.store.last_applied_index();
        if entry.index <= last {
            tracing::debug!(
                "Node {} skipping already applied entry {} (watermark {})",
                self.node_id,
                entry.index,
                last
            );
            return Ok(None);
        }
        if entry.index != last + 1 {
            return Err(ReplicationError::OutOfOrder {
                expected: last + 1,
                got: entry.index,
            });
        }

        let applied = match &entry.payload {
            EntryPayload::Noop => {
                self.store.record_noop(entry.index, entry.term);
                None
            }
            EntryPayload::Transaction(tx) => {
                let outcome = self.store.apply_transaction(entry.index, entry.term, tx);
                if let ApplyOutcome::Rejected(reason) = &outcome {
                    tracing::debug!("Entry {} rejected by state: {}", entry.index, reason);
                }
                let event = AppliedTransaction {
                    index: entry.index,
                    term: entry.term,
                    transaction: tx.clone(),
                    outcome,
                };
                let _ = self.applied_tx.send(event.clone());
                Some(event)
            }
        };

        self.applied_index.send_replace(entry.index);
        Ok(applied)
    }

    /// Replace the state wholesale with a consensus snapshot. A faulted
    /// replica takes it even when it is not ahead of the applied index.
    pub fn install_snapshot(&self, snapshot: &Snapshot) -> Result<(), ReplicationError> {
        let current = self.store.last_applied_index();
        if snapshot.last_included_index <= current && !self.is_faulted() {
            tracing::debug!(
                "Node {} ignoring snapshot through {} (applied through {})",
                self.node_id,
                snapshot.last_included_index,
                current
            );
            return Ok(());
        }

        let decoded: StateSnapshot = bincode::deserialize(&snapshot.data)?;
        if decoded.last_applied_index != snapshot.last_included_index {
            return Err(ReplicationError::SnapshotMismatch {
                claimed: snapshot.last_included_index,
                actual: decoded.last_applied_index,
            });
        }
        self.store.restore(&snapshot.data)?;
        *self.last_snapshot_index.lock() = snapshot.last_included_index;
        if self.faulted.swap(false, Ordering::SeqCst) {
            tracing::info!("Node {} replica recovered from snapshot", self.node_id);
        }
        self.applied_index.send_replace(snapshot.last_included_index);

        tracing::info!(
            "Node {} installed state snapshot through index {} ({} accounts)",
            self.node_id,
            snapshot.last_included_index,
            decoded.balances.len()
        );
        Ok(())
    }

    /// Consensus snapshot of the current state
    pub fn snapshot(&self) -> Result<Snapshot, ReplicationError> {
        let state = self.store.snapshot();
        Ok(Snapshot {
            last_included_index: state.last_applied_index,
            last_included_term: state.last_applied_term,
            data: bincode::serialize(&state)?,
        })
    }

    /// Take a snapshot and compact the log once enough entries were applied
    pub fn maybe_snapshot(&self) -> Result<(), ReplicationError> {
        if self.snapshot_interval == 0 {
            return Ok(());
        }
        let applied = self.store.last_applied_index();
        let mut last = self.last_snapshot_index.lock();
        if applied < *last + self.snapshot_interval {
            return Ok(());
        }
        let snapshot = self.snapshot()?;
        let index = snapshot.last_included_index;
        self.raft.compact(snapshot)?;
        *last = index;
        tracing::debug!("Node {} snapshotted state at index {}", self.node_id, index);
        Ok(())
    }

    fn handle_apply_msg(&self, msg: &ApplyMsg) -> Result<(), ReplicationError> {
        match msg {
            ApplyMsg::Snapshot(snapshot) => self.install_snapshot(snapshot),
            ApplyMsg::Entries(entries) => {
                for entry in entries {
                    self.apply(entry)?;
                }
                Ok(())
            }
        }
    }

    /// Handle one message from the apply channel
    pub fn process(&self, msg: ApplyMsg) {
        if let (true, ApplyMsg::Entries(entries)) = (self.is_faulted(), &msg) {
            tracing::debug!(
                "Node {} faulted, dropping {} entries",
                self.node_id,
                entries.len()
            );
            return;
        }
        if let Err(e) = self.handle_apply_msg(&msg) {
            tracing::error!(
                "Node {} apply failed at watermark {}, resyncing: {}",
                self.node_id,
                self.store.last_applied_index(),
                e
            );
            self.faulted.store(true, Ordering::SeqCst);
            self.raft.begin_resync();
            return;
        }
        if let Err(e) = self.maybe_snapshot() {
            tracing::warn!("Node {} snapshot failed: {}", self.node_id, e);
        }
    }

    // === Roles ===

    pub fn set_as_leader(&self, peers: &[NodeId]) {
        tracing::info!(
            "Node {} replica now leading, replicating to {:?}",
            self.node_id,
            peers
        );
        self.leading.store(true, Ordering::SeqCst);
    }

    pub fn set_as_follower(&self) {
        if self.leading.swap(false, Ordering::SeqCst) {
            tracing::info!("Node {} replica now following", self.node_id);
        }
    }

    fn on_role_change(&self, change: RoleChange) {
        match change {
            RoleChange::BecameLeader { .. } => self.set_as_leader(&self.raft.peers()),
            RoleChange::BecameCandidate { .. } | RoleChange::BecameFollower { .. } => {
                self.set_as_follower()
            }
        }
        let _ = self.role_tx.send(change);
    }

    // === Tasks ===

    /// Spawn the apply task and the role-event task
    pub fn start(self: &Arc<Self>, mut apply_rx: mpsc::UnboundedReceiver<ApplyMsg>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let replication = self.clone();
        handles.push(tokio::spawn(async move {
            while let Some(msg) = apply_rx.recv().await {
                replication.process(msg);
            }
            tracing::info!("Node {} apply channel closed", replication.node_id);
        }));

        if let Some(mut roles) = self.raft_roles.lock().take() {
            let replication = self.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match roles.recv().await {
                        Ok(change) => replication.on_role_change(change),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Node {} missed {} role changes", replication.node_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sequencer_consensus::{LocalNetwork, LogStorage, MemoryLogStorage, RaftConfig, SledLogStorage};
    use ed25519_dalek::SigningKey;
    use sequencer_types::TRANSFER_GAS;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::Instant;

    fn replication(interval: u64, genesis: &[(AccountId, Amount)]) -> Arc<StateReplication> {
        let network = LocalNetwork::new();
        let (raft, _rx) = RaftNode::new(
            RaftConfig::default(),
            Arc::new(MemoryLogStorage::new()),
            network.transport_for(1),
        )
        .unwrap();
        StateReplication::new(raft, genesis, interval)
    }

    fn tx_entry(index: u64, key: &SigningKey, nonce: u64) -> LogEntry {
        let tx = Transaction::signed_at(key, AccountId::new([9; 32]), 5, nonce, 1, TRANSFER_GAS, 0);
        LogEntry::new(index, 1, EntryPayload::Transaction(tx))
    }

    #[tokio::test]
    async fn test_apply_in_order_and_publish() {
        let key = SigningKey::from_bytes(&[1; 32]);
        let replica = replication(0, &[(AccountId::from(&key), 100)]);
        let feed = replica.applied_feed();

        replica.apply(&LogEntry::new(1, 1, EntryPayload::Noop)).unwrap();
        let event = replica.apply(&tx_entry(2, &key, 0)).unwrap().unwrap();
        assert_eq!(event.outcome, ApplyOutcome::Applied);
        assert_eq!(feed.try_recv().unwrap().index, 2);
        assert_eq!(replica.last_applied_index(), 2);
        assert_eq!(*replica.watch_applied().borrow(), 2);
    }

    #[tokio::test]
    async fn test_reapply_is_noop_and_gap_is_error() {
        let key = SigningKey::from_bytes(&[1; 32]);
        let replica = replication(0, &[(AccountId::from(&key), 100)]);
        let entry = tx_entry(1, &key, 0);

        replica.apply(&entry).unwrap();
        let before = replica.state_root().unwrap();
        assert!(replica.apply(&entry).unwrap().is_none());
        assert_eq!(replica.state_root().unwrap(), before);

        let err = replica.apply(&tx_entry(5, &key, 1)).unwrap_err();
        assert!(matches!(err, ReplicationError::OutOfOrder { expected: 2, got: 5 }));
    }

    #[tokio::test]
    async fn test_snapshot_install_replaces_state() {
        let key = SigningKey::from_bytes(&[1; 32]);
        let genesis = [(AccountId::from(&key), 100)];
        let source = replication(0, &genesis);
        source.apply(&LogEntry::new(1, 1, EntryPayload::Noop)).unwrap();
        source.apply(&tx_entry(2, &key, 0)).unwrap();
        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot.last_included_index, 2);

        let target = replication(0, &genesis);
        target.install_snapshot(&snapshot).unwrap();
        assert_eq!(target.last_applied_index(), 2);
        assert_eq!(target.state_root().unwrap(), source.state_root().unwrap());

        // Applying continues from the snapshot
        target.apply(&tx_entry(3, &key, 1)).unwrap();
        assert_eq!(target.nonce(&AccountId::from(&key)), 2);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_rejected() {
        let replica = replication(0, &[]);
        let bogus = Snapshot {
            last_included_index: 4,
            last_included_term: 1,
            data: bincode::serialize(&StateSnapshot::default()).unwrap(),
        };
        assert!(matches!(
            replica.install_snapshot(&bogus),
            Err(ReplicationError::SnapshotMismatch { claimed: 4, actual: 0 })
        ));
    }

    #[tokio::test]
    async fn test_role_changes_are_republished() {
        let replica = replication(0, &[]);
        let mut roles = replica.subscribe_roles();

        replica.on_role_change(RoleChange::BecameLeader { term: 3 });
        assert!(replica.is_leader());
        assert_eq!(roles.recv().await.unwrap(), RoleChange::BecameLeader { term: 3 });

        replica.on_role_change(RoleChange::BecameFollower { term: 4, leader_id: Some(2) });
        assert!(!replica.is_leader());
    }

    #[tokio::test]
    async fn test_failed_apply_faults_until_snapshot() {
        let key = SigningKey::from_bytes(&[1; 32]);
        let genesis = [(AccountId::from(&key), 100)];
        let source = replication(0, &genesis);
        source.apply(&LogEntry::new(1, 1, EntryPayload::Noop)).unwrap();
        source.apply(&tx_entry(2, &key, 0)).unwrap();
        source.apply(&tx_entry(3, &key, 1)).unwrap();

        let replica = replication(0, &genesis);
        replica.process(ApplyMsg::Entries(vec![LogEntry::new(1, 1, EntryPayload::Noop)]));
        replica.process(ApplyMsg::Entries(vec![tx_entry(3, &key, 1)]));
        assert!(replica.is_faulted());
        assert!(!replica.raft.is_participating());

        // Entries arriving on top of a broken prefix are not applied
        replica.process(ApplyMsg::Entries(vec![tx_entry(2, &key, 0)]));
        assert_eq!(replica.last_applied_index(), 1);
        assert_eq!(replica.nonce(&AccountId::from(&key)), 0);

        replica.process(ApplyMsg::Snapshot(source.snapshot().unwrap()));
        assert!(!replica.is_faulted());
        assert_eq!(replica.last_applied_index(), 3);
        assert_eq!(replica.state_root().unwrap(), source.state_root().unwrap());
    }

    #[tokio::test]
    async fn test_faulted_replica_takes_snapshot_at_its_watermark() {
        let replica = replication(0, &[]);
        replica.process(ApplyMsg::Entries(vec![LogEntry::new(1, 1, EntryPayload::Noop)]));
        let at_one = replica.snapshot().unwrap();

        let bogus = Snapshot {
            last_included_index: 2,
            last_included_term: 1,
            data: vec![0xff],
        };
        replica.process(ApplyMsg::Snapshot(bogus));
        assert!(replica.is_faulted());

        replica.process(ApplyMsg::Snapshot(at_one));
        assert!(!replica.is_faulted());
        assert_eq!(replica.last_applied_index(), 1);
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, f: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !f() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn sled_node(
        db: &sled::Db,
        genesis: &[(AccountId, Amount)],
    ) -> (Arc<RaftNode>, Arc<StateReplication>, Vec<JoinHandle<()>>) {
        let storage = SledLogStorage::with_db(db.clone(), 1).unwrap();
        let config = RaftConfig {
            node_id: 1,
            peers: vec![],
            election_timeout_min: Duration::from_millis(50),
            election_timeout_max: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(20),
            ..RaftConfig::default()
        };
        let network = LocalNetwork::new();
        let (raft, apply_rx) = RaftNode::new(config, Arc::new(storage), network.transport_for(1)).unwrap();
        let replica = StateReplication::new(raft.clone(), genesis, 3);
        let mut tasks = replica.start(apply_rx);
        tasks.push(raft.start());
        (raft, replica, tasks)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_state_survives_restart_over_sled() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let key = SigningKey::from_bytes(&[1; 32]);
        let sender = AccountId::from(&key);
        let genesis = [(sender, 1_000)];

        let (first_term, balance) = {
            let (raft, replica, tasks) = sled_node(&db, &genesis);
            wait_for("a leader", || raft.is_leader()).await;
            for nonce in 0..7 {
                let tx = Transaction::signed_at(&key, AccountId::new([9; 32]), 5, nonce, 1, TRANSFER_GAS, 0);
                raft.propose(EntryPayload::Transaction(tx)).unwrap();
            }
            wait_for("every transfer to apply", || replica.nonce(&sender) == 7).await;
            let term = raft.current_term();
            let balance = replica.balance(&sender);
            raft.shutdown();
            for task in tasks {
                task.abort();
            }
            (term, balance)
        };

        let storage = SledLogStorage::with_db(db.clone(), 1).unwrap();
        assert!(storage.load_snapshot().unwrap().is_some());
        assert!(storage.load_hard_state().unwrap().current_term >= first_term);

        let (raft, replica, tasks) = sled_node(&db, &genesis);
        wait_for("the restarted node to replay its log", || replica.nonce(&sender) == 7).await;
        assert_eq!(replica.balance(&sender), balance);
        assert_eq!(replica.balance(&AccountId::new([9; 32])), 35);
        assert!(raft.current_term() > first_term);
        raft.shutdown();
        for task in tasks {
            task.abort();
        }
    }
}
