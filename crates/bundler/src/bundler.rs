//! Transaction bundler
//!
//! Every node queues applied transactions in a backlog. Only the leader
//! drains the backlog into bundles, finalizes them and submits them for
//! settlement. Submission of one bundle is serialized by the Ready ->
//! Processing checkout.

use crate::bundle::{Bundle, BundleId, BundleLimits, BundleStatus, SequencedTransaction};
use crate::error::{BundlerError, SettlementError};
use crate::policy::OrderingStrategy;
use crate::settlement::{
    AlertSink, BundleSigner, GasPriceOracle, GasStrategy, SettlementReceipt, SettlementSubmitter,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use sequencer_consensus::RoleChange;
use sequencer_state::{AppliedTransaction, ApplyOutcome};
use sequencer_types::{unix_millis, NodeId, TransactionId};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct BundlerConfig {
    pub max_transactions_per_bundle: usize,
    /// Finalize once a bundle holds this many transactions
    pub min_transactions_to_finalize: usize,
    /// Finalize once a non-empty bundle is this old
    pub max_bundle_age: Duration,
    pub max_gas_per_bundle: u64,
    pub max_retries: u32,
    pub gas_price_boost_factor: f64,
    pub submission_timeout: Duration,
    /// Pending/Ready bundles expire after this long
    pub bundle_ttl: Duration,
    /// Terminal bundles and follower backlog entries are dropped after this long
    pub bundle_retention: Duration,
    pub tick_interval: Duration,
    pub gas_strategy: GasStrategy,
    pub ordering: OrderingStrategy,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            max_transactions_per_bundle: 100,
            min_transactions_to_finalize: 10,
            max_bundle_age: Duration::from_secs(2),
            max_gas_per_bundle: 30_000_000,
            max_retries: 3,
            gas_price_boost_factor: 1.25,
            submission_timeout: Duration::from_secs(10),
            bundle_ttl: Duration::from_secs(60),
            bundle_retention: Duration::from_secs(300),
            tick_interval: Duration::from_millis(100),
            gas_strategy: GasStrategy::Standard,
            ordering: OrderingStrategy::ArrivalOrder,
        }
    }
}

impl BundlerConfig {
    fn limits(&self) -> BundleLimits {
        BundleLimits {
            max_transactions: self.max_transactions_per_bundle,
            max_gas: self.max_gas_per_bundle,
            max_retries: self.max_retries,
            gas_boost_factor: self.gas_price_boost_factor,
            ttl: self.bundle_ttl,
        }
    }
}

/// Where a transaction is in its life, as seen by this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TxStatus {
    /// Appended to the leader's log, not yet applied
    Pending { index: u64, term: u64 },
    /// Handed to the leader, which already knew it
    Forwarded { leader: NodeId },
    Applied { index: u64 },
    Rejected { reason: String },
    Bundled { bundle: BundleId },
    Settled { bundle: BundleId, block_number: u64 },
    /// The bundle carrying it failed permanently or expired
    Failed { bundle: BundleId },
}

impl TxStatus {
    /// Applied or past it
    fn is_applied(&self) -> bool {
        !matches!(self, TxStatus::Pending { .. } | TxStatus::Forwarded { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BundlerStats {
    pub bundles_created: u64,
    pub bundles_confirmed: u64,
    pub bundles_failed: u64,
    pub bundles_retried: u64,
    pub bundles_aborted: u64,
    pub bundles_expired: u64,
    pub transactions_settled: u64,
}

/// What one submission attempt ended with
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Confirmed(SettlementReceipt),
    /// Every transaction was already settled elsewhere
    AlreadySettled,
    /// Failed; a retry child was created
    Retrying { child: BundleId },
    /// Failed with no retry left, or no longer leader
    Failed,
}

#[derive(Default)]
struct BundlerState {
    /// Term we lead in; `None` while following
    leader_term: Option<u64>,
    next_seq: u64,
    backlog: VecDeque<SequencedTransaction>,
    /// Bundle accepting transactions
    open: Option<BundleId>,
    bundles: BTreeMap<BundleId, Bundle>,
    stats: BundlerStats,
}

impl BundlerState {
    fn next_id(&mut self) -> Option<BundleId> {
        let term = self.leader_term?;
        let id = BundleId {
            term,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        Some(id)
    }

    /// Put transactions back at the backlog front, lowest index first
    fn requeue(&mut self, mut txs: Vec<SequencedTransaction>) {
        txs.sort_by_key(|t| t.index);
        for tx in txs.into_iter().rev() {
            self.backlog.push_front(tx);
        }
    }
}

pub struct TransactionBundler {
    node_id: NodeId,
    config: BundlerConfig,
    state: Mutex<BundlerState>,
    tx_status: DashMap<TransactionId, TxStatus>,
    submitter: Arc<dyn SettlementSubmitter>,
    oracle: Arc<dyn GasPriceOracle>,
    signer: Arc<dyn BundleSigner>,
    alerts: Arc<dyn AlertSink>,
}

impl TransactionBundler {
    pub fn new(
        node_id: NodeId,
        config: BundlerConfig,
        submitter: Arc<dyn SettlementSubmitter>,
        oracle: Arc<dyn GasPriceOracle>,
        signer: Arc<dyn BundleSigner>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            node_id,
            config,
            state: Mutex::new(BundlerState::default()),
            tx_status: DashMap::new(),
            submitter,
            oracle,
            signer,
            alerts,
        }
    }

    pub fn config(&self) -> &BundlerConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        self.state.lock().leader_term.is_some()
    }

    pub fn stats(&self) -> BundlerStats {
        self.state.lock().stats.clone()
    }

    pub fn bundle(&self, id: &BundleId) -> Option<Bundle> {
        self.state.lock().bundles.get(id).cloned()
    }

    pub fn bundles(&self) -> Vec<Bundle> {
        self.state.lock().bundles.values().cloned().collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.state.lock().backlog.len()
    }

    // === Transaction status ===

    pub fn status(&self, id: &TransactionId) -> Option<TxStatus> {
        self.tx_status.get(id).map(|s| s.clone())
    }

    /// Record a freshly proposed transaction unless it is already known
    pub fn record_pending(&self, id: TransactionId, index: u64, term: u64) -> TxStatus {
        self.tx_status
            .entry(id)
            .or_insert(TxStatus::Pending { index, term })
            .clone()
    }

    pub fn record_rejected(&self, id: TransactionId, reason: String) {
        self.tx_status.insert(id, TxStatus::Rejected { reason });
    }

    fn set_status(&self, txs: &[SequencedTransaction], status: TxStatus) {
        for tx in txs {
            self.tx_status.insert(tx.id(), status.clone());
        }
    }

    /// Account one applied transaction entry
    pub fn on_applied(&self, event: AppliedTransaction) {
        let id = event.transaction.id;
        match event.outcome {
            ApplyOutcome::Applied => {
                let replaced = match self.tx_status.get(&id) {
                    Some(status) => !status.is_applied(),
                    None => true,
                };
                if replaced {
                    self.tx_status.insert(id, TxStatus::Applied { index: event.index });
                }
                self.state.lock().backlog.push_back(SequencedTransaction {
                    index: event.index,
                    transaction: event.transaction,
                    queued_at: unix_millis(),
                });
            }
            ApplyOutcome::Duplicate => {
                tracing::debug!("Entry {} replays transaction {}, not bundled", event.index, id);
                // A fresh id on a consumed nonce never applied anywhere
                let unresolved = self.tx_status.get(&id).map_or(true, |status| !status.is_applied());
                if unresolved {
                    self.record_rejected(
                        id,
                        format!("nonce {} already used", event.transaction.nonce),
                    );
                }
            }
            ApplyOutcome::Rejected(reason) => {
                self.record_rejected(id, reason.to_string());
            }
        }
    }

    // === Roles ===

    pub fn on_became_leader(&self, term: u64) {
        let mut state = self.state.lock();
        state.leader_term = Some(term);
        state.next_seq = 0;
        state.open = None;
        tracing::info!(
            "Node {} bundling as leader in term {} ({} queued)",
            self.node_id,
            term,
            state.backlog.len()
        );
    }

    /// Abort unsubmitted bundles and return their transactions to the backlog
    pub fn on_became_follower(&self) {
        let now = unix_millis();
        let mut state = self.state.lock();
        let was_leader = state.leader_term.take().is_some();
        state.open = None;

        let mut requeued = Vec::new();
        let mut aborted = 0;
        for bundle in state.bundles.values_mut() {
            if matches!(bundle.status, BundleStatus::Pending | BundleStatus::Ready)
                && bundle.transition(BundleStatus::Aborted, now).is_ok()
            {
                bundle.failure_reason = Some("leadership lost".to_string());
                requeued.extend(bundle.transactions.iter().cloned());
                aborted += 1;
            }
        }
        state.stats.bundles_aborted += aborted;
        for tx in &requeued {
            self.tx_status.insert(tx.id(), TxStatus::Applied { index: tx.index });
        }
        let count = requeued.len();
        state.requeue(requeued);

        if was_leader {
            tracing::info!(
                "Node {} stopped bundling: aborted {} bundle(s), requeued {} transaction(s)",
                self.node_id,
                aborted,
                count
            );
        }
    }

    // === Bundle lifecycle ===

    /// Drain the backlog into bundles. Leader only.
    pub fn fill(&self, now: u64) {
        let mut state = self.state.lock();
        if state.leader_term.is_none() || state.backlog.is_empty() {
            return;
        }
        let mut batch: Vec<SequencedTransaction> = state.backlog.drain(..).collect();
        self.config.ordering.order(&mut batch);
        let limits = self.config.limits();

        for tx in batch {
            let open = state.open.filter(|id| {
                state
                    .bundles
                    .get(id)
                    .map(|b| b.status == BundleStatus::Pending)
                    .unwrap_or(false)
            });
            let target = match open {
                Some(id) => {
                    let full = state
                        .bundles
                        .get(&id)
                        .map(|b| !b.is_empty() && b.would_overflow(tx.gas()))
                        .unwrap_or(true);
                    if full {
                        self.finalize(&mut state, id, now);
                        None
                    } else {
                        Some(id)
                    }
                }
                None => None,
            };
            let target = match target {
                Some(id) => id,
                None => match state.next_id() {
                    Some(id) => {
                        state.bundles.insert(id, Bundle::new(id, &limits, now));
                        state.open = Some(id);
                        state.stats.bundles_created += 1;
                        tracing::debug!("Node {} opened bundle {}", self.node_id, id);
                        id
                    }
                    None => return,
                },
            };
            self.tx_status
                .insert(tx.id(), TxStatus::Bundled { bundle: target });
            if let Some(bundle) = state.bundles.get_mut(&target) {
                bundle.push(tx, now);
            }
        }
    }

    fn finalize(&self, state: &mut BundlerState, id: BundleId, now: u64) {
        if let Some(bundle) = state.bundles.get_mut(&id) {
            if bundle.transition(BundleStatus::Ready, now).is_ok() {
                tracing::info!(
                    "Bundle {} ready with {} txs (gas {})",
                    id,
                    bundle.transaction_count(),
                    bundle.current_gas
                );
            }
        }
        if state.open == Some(id) {
            state.open = None;
        }
    }

    /// Finalize the open bundle when it is big or old enough
    pub fn finalize_due(&self, now: u64) {
        let mut state = self.state.lock();
        let Some(id) = state.open else {
            return;
        };
        let due = state
            .bundles
            .get(&id)
            .map(|b| {
                !b.is_empty()
                    && (b.transaction_count() >= self.config.min_transactions_to_finalize
                        || b.age_ms(now) >= self.config.max_bundle_age.as_millis() as u64)
            })
            .unwrap_or(false);
        if due {
            self.finalize(&mut state, id, now);
        }
    }

    /// Expire Pending/Ready bundles past their deadline
    pub fn expire(&self, now: u64) -> Vec<BundleId> {
        let mut expired = Vec::new();
        {
            let mut state = self.state.lock();
            let mut count = 0;
            for bundle in state.bundles.values_mut() {
                if matches!(bundle.status, BundleStatus::Pending | BundleStatus::Ready)
                    && bundle.is_expired(now)
                    && bundle.transition(BundleStatus::Expired, now).is_ok()
                {
                    bundle.failure_reason = Some("expired before submission".to_string());
                    self.set_status(&bundle.transactions, TxStatus::Failed { bundle: bundle.id });
                    expired.push(bundle.clone());
                    count += 1;
                }
            }
            state.stats.bundles_expired += count;
            if let Some(open) = state.open {
                if expired.iter().any(|b| b.id == open) {
                    state.open = None;
                }
            }
        }
        for bundle in &expired {
            self.alerts.bundle_failed(bundle, "expired before submission");
        }
        expired.into_iter().map(|b| b.id).collect()
    }

    /// Drop terminal bundles older than the retention window
    pub fn gc(&self, now: u64) -> usize {
        let retention = self.config.bundle_retention.as_millis() as u64;
        let mut state = self.state.lock();
        let before = state.bundles.len();
        state
            .bundles
            .retain(|_, b| !(b.status.is_terminal() && b.updated_at + retention <= now));
        let removed = before - state.bundles.len();
        if removed > 0 {
            tracing::debug!("Node {} removed {} old bundle(s)", self.node_id, removed);
        }
        removed
    }

    /// Followers forget backlog entries older than the retention window
    pub fn prune_backlog(&self, now: u64) -> usize {
        let retention = self.config.bundle_retention.as_millis() as u64;
        let mut state = self.state.lock();
        if state.leader_term.is_some() {
            return 0;
        }
        let before = state.backlog.len();
        state.backlog.retain(|t| t.queued_at + retention > now);
        before - state.backlog.len()
    }

    pub fn ready_bundles(&self) -> Vec<BundleId> {
        self.state
            .lock()
            .bundles
            .values()
            .filter(|b| b.status == BundleStatus::Ready)
            .map(|b| b.id)
            .collect()
    }

    // === Submission ===

    /// Check out a Ready bundle and push it through settlement
    pub async fn submit_bundle(&self, id: BundleId) -> Result<SubmitOutcome, BundlerError> {
        let candidate = {
            let mut state = self.state.lock();
            let bundle = state
                .bundles
                .get_mut(&id)
                .ok_or(BundlerError::UnknownBundle(id))?;
            if bundle.status != BundleStatus::Ready {
                return Err(BundlerError::NotReady {
                    id,
                    status: bundle.status,
                });
            }
            bundle.transition(BundleStatus::Processing, unix_millis())?;
            bundle.clone()
        };

        let mut settled = Vec::new();
        for tx in &candidate.transactions {
            let local = matches!(self.status(&tx.id()), Some(TxStatus::Settled { .. }));
            if local || self.submitter.is_settled(&tx.id()).await {
                settled.push(tx.id());
            }
        }
        if !settled.is_empty() {
            let emptied = {
                let mut state = self.state.lock();
                let bundle = state
                    .bundles
                    .get_mut(&id)
                    .ok_or(BundlerError::UnknownBundle(id))?;
                bundle.retain_transactions(|t| !settled.contains(&t.id()));
                if bundle.is_empty() {
                    bundle.transition(BundleStatus::Aborted, unix_millis())?;
                    bundle.failure_reason = Some("all transactions already settled".to_string());
                    state.stats.bundles_aborted += 1;
                    true
                } else {
                    false
                }
            };
            tracing::info!(
                "Bundle {} dropped {} already settled transaction(s)",
                id,
                settled.len()
            );
            if emptied {
                return Ok(SubmitOutcome::AlreadySettled);
            }
        }

        if candidate.base_gas_price.is_none() {
            match self.oracle.get_optimal_gas_price(self.config.gas_strategy).await {
                Ok(price) => {
                    if let Some(bundle) = self.state.lock().bundles.get_mut(&id) {
                        bundle.base_gas_price = Some(price);
                    }
                }
                Err(e) => return Ok(self.fail_bundle(id, &e.to_string())),
            }
        }

        let outgoing = {
            let mut state = self.state.lock();
            let bundle = state
                .bundles
                .get_mut(&id)
                .ok_or(BundlerError::UnknownBundle(id))?;
            bundle.signature = Some(self.signer.sign(&bundle.digest()));
            bundle.transition(BundleStatus::Submitting, unix_millis())?;
            bundle.clone()
        };
        tracing::info!(
            "Submitting bundle {} (attempt {}, {} txs, gas price {:?})",
            id,
            outgoing.retry_count + 1,
            outgoing.transaction_count(),
            outgoing.effective_gas_price()
        );

        let timeout = self.config.submission_timeout;
        let result = match tokio::time::timeout(timeout, self.submitter.submit(&outgoing)).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        };

        match result {
            Ok(receipt) => {
                let mut state = self.state.lock();
                let bundle = state
                    .bundles
                    .get_mut(&id)
                    .ok_or(BundlerError::UnknownBundle(id))?;
                bundle.transition(BundleStatus::Confirmed, unix_millis())?;
                bundle.block_number = Some(receipt.block_number);
                bundle.gas_used = Some(receipt.gas_used);
                self.set_status(
                    &bundle.transactions,
                    TxStatus::Settled {
                        bundle: id,
                        block_number: receipt.block_number,
                    },
                );
                let count = bundle.transaction_count() as u64;
                state.stats.bundles_confirmed += 1;
                state.stats.transactions_settled += count;
                tracing::info!(
                    "Bundle {} confirmed in block {} (gas used {})",
                    id,
                    receipt.block_number,
                    receipt.gas_used
                );
                Ok(SubmitOutcome::Confirmed(receipt))
            }
            Err(e) => Ok(self.fail_bundle(id, &e.to_string())),
        }
    }

    /// Mark an in-flight bundle Failed and decide what happens to its transactions
    fn fail_bundle(&self, id: BundleId, reason: &str) -> SubmitOutcome {
        let now = unix_millis();
        let mut alert = None;
        let outcome = {
            let mut state = self.state.lock();
            let Some(bundle) = state.bundles.get_mut(&id) else {
                return SubmitOutcome::Failed;
            };
            if bundle.transition(BundleStatus::Failed, now).is_err() {
                return SubmitOutcome::Failed;
            }
            bundle.failure_reason = Some(reason.to_string());
            let failed = bundle.clone();
            state.stats.bundles_failed += 1;
            tracing::warn!(
                "Bundle {} attempt {} failed: {}",
                id,
                failed.retry_count + 1,
                reason
            );

            if state.leader_term.is_none() {
                for tx in &failed.transactions {
                    self.tx_status.insert(tx.id(), TxStatus::Applied { index: tx.index });
                }
                state.requeue(failed.transactions);
                SubmitOutcome::Failed
            } else if failed.can_retry() {
                match state.next_id() {
                    Some(child_id) => {
                        let child = failed.retry_child(child_id, self.config.bundle_ttl, now);
                        self.set_status(&child.transactions, TxStatus::Bundled { bundle: child_id });
                        state.bundles.insert(child_id, child);
                        state.stats.bundles_retried += 1;
                        tracing::info!(
                            "Bundle {} retrying as {} (retry {}/{})",
                            id,
                            child_id,
                            failed.retry_count + 1,
                            failed.max_retries
                        );
                        SubmitOutcome::Retrying { child: child_id }
                    }
                    None => SubmitOutcome::Failed,
                }
            } else {
                self.set_status(&failed.transactions, TxStatus::Failed { bundle: id });
                alert = Some(failed);
                SubmitOutcome::Failed
            }
        };
        if let Some(bundle) = alert {
            self.alerts.bundle_failed(&bundle, reason);
        }
        outcome
    }

    // === Loop ===

    /// One bundling pass
    pub async fn tick(&self) {
        let now = unix_millis();
        self.expire(now);
        self.prune_backlog(now);
        self.fill(now);
        self.finalize_due(now);

        let ready = self.ready_bundles();
        if !ready.is_empty() {
            let attempts = ready.into_iter().map(|id| self.submit_bundle(id));
            for result in futures::future::join_all(attempts).await {
                if let Err(e) = result {
                    tracing::debug!("Skipped bundle submission: {}", e);
                }
            }
        }
        self.gc(now);
    }

    fn drain_feed(&self, feed: &crossbeam_channel::Receiver<AppliedTransaction>) {
        for event in feed.try_iter() {
            self.on_applied(event);
        }
    }

    /// Bundling task: ticks on a timer and follows role changes
    pub async fn run(
        self: Arc<Self>,
        mut roles: broadcast::Receiver<RoleChange>,
        feed: crossbeam_channel::Receiver<AppliedTransaction>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_feed(&feed);
                    self.tick().await;
                }
                change = roles.recv() => match change {
                    Ok(RoleChange::BecameLeader { term }) => {
                        self.drain_feed(&feed);
                        self.on_became_leader(term);
                    }
                    Ok(RoleChange::BecameFollower { .. }) | Ok(RoleChange::BecameCandidate { .. }) => {
                        self.drain_feed(&feed);
                        self.on_became_follower();
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Node {} bundler missed {} role changes", self.node_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("Node {} bundler stopped", self.node_id);
    }
}
