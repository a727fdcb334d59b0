//! Bundles and their lifecycle
//!
//! ```text
//! Pending -> Ready -> Processing -> Submitting -> Confirmed
//!                     Processing | Submitting -> Failed
//!   Pending | Ready -> Aborted | Expired
//!        Processing -> Aborted   (every transaction already settled)
//! ```
//!
//! A retry never revives a bundle: it creates a child in Ready that points
//! back through `parent_bundle_id`.

use crate::error::BundlerError;
use sequencer_types::{Transaction, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Leader term plus a per-leader sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId {
    pub term: u64,
    pub seq: u64,
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BundleStatus {
    /// Open, accepting transactions
    Pending,
    /// Finalized, waiting for submission
    Ready,
    /// Checked out by one submission attempt
    Processing,
    /// Handed to the settlement layer
    Submitting,
    Confirmed,
    Failed,
    Aborted,
    Expired,
}

impl BundleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BundleStatus::Confirmed | BundleStatus::Failed | BundleStatus::Aborted | BundleStatus::Expired
        )
    }

    pub fn can_transition_to(self, next: BundleStatus) -> bool {
        use BundleStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Aborted)
                | (Pending, Expired)
                | (Ready, Processing)
                | (Ready, Aborted)
                | (Ready, Expired)
                | (Processing, Submitting)
                | (Processing, Failed)
                | (Processing, Aborted)
                | (Submitting, Confirmed)
                | (Submitting, Failed)
        )
    }
}

/// A committed transaction with its log position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedTransaction {
    pub index: u64,
    pub transaction: Transaction,
    /// Unix millis when the bundler queued it
    pub queued_at: u64,
}

impl SequencedTransaction {
    pub fn id(&self) -> TransactionId {
        self.transaction.id
    }

    pub fn gas(&self) -> u64 {
        self.transaction.gas_limit
    }
}

/// Size and lifetime limits applied to new bundles
#[derive(Debug, Clone)]
pub struct BundleLimits {
    pub max_transactions: usize,
    pub max_gas: u64,
    pub max_retries: u32,
    pub gas_boost_factor: f64,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub id: BundleId,
    pub status: BundleStatus,
    pub transactions: Vec<SequencedTransaction>,
    pub current_gas: u64,
    pub max_gas: u64,
    pub max_transactions: usize,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Gas price chosen on the first attempt
    pub base_gas_price: Option<u64>,
    pub gas_boost_factor: f64,
    pub created_at: u64,
    pub updated_at: u64,
    pub expires_at: u64,
    pub parent_bundle_id: Option<BundleId>,
    pub signature: Option<Vec<u8>>,
    pub block_number: Option<u64>,
    pub gas_used: Option<u64>,
    pub failure_reason: Option<String>,
}

impl Bundle {
    pub fn new(id: BundleId, limits: &BundleLimits, now: u64) -> Self {
        Self {
            id,
            status: BundleStatus::Pending,
            transactions: Vec::new(),
            current_gas: 0,
            max_gas: limits.max_gas,
            max_transactions: limits.max_transactions,
            retry_count: 0,
            max_retries: limits.max_retries,
            base_gas_price: None,
            gas_boost_factor: limits.gas_boost_factor,
            created_at: now,
            updated_at: now,
            expires_at: now + limits.ttl.as_millis() as u64,
            parent_bundle_id: None,
            signature: None,
            block_number: None,
            gas_used: None,
            failure_reason: None,
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(|t| t.id()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Adding `gas` more would break the count or gas limit
    pub fn would_overflow(&self, gas: u64) -> bool {
        self.transactions.len() + 1 > self.max_transactions
            || self.current_gas.saturating_add(gas) > self.max_gas
    }

    pub fn push(&mut self, tx: SequencedTransaction, now: u64) {
        self.current_gas = self.current_gas.saturating_add(tx.gas());
        self.transactions.push(tx);
        self.updated_at = now;
    }

    /// Replace the contents, keeping gas accounting in step
    pub fn retain_transactions(&mut self, keep: impl Fn(&SequencedTransaction) -> bool) {
        self.transactions.retain(|t| keep(t));
        self.current_gas = self.transactions.iter().map(|t| t.gas()).sum();
    }

    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn transition(&mut self, to: BundleStatus, now: u64) -> Result<(), BundlerError> {
        if !self.status.can_transition_to(to) {
            return Err(BundlerError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// Gas price for this attempt: `base * boost^retry_count`
    pub fn effective_gas_price(&self) -> Option<u64> {
        self.base_gas_price.map(|base| {
            (base as f64 * self.gas_boost_factor.powi(self.retry_count as i32)).round() as u64
        })
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// New Ready bundle carrying the same transactions, one retry further
    pub fn retry_child(&self, id: BundleId, ttl: Duration, now: u64) -> Bundle {
        Bundle {
            id,
            status: BundleStatus::Ready,
            transactions: self.transactions.clone(),
            current_gas: self.current_gas,
            max_gas: self.max_gas,
            max_transactions: self.max_transactions,
            retry_count: self.retry_count + 1,
            max_retries: self.max_retries,
            base_gas_price: self.base_gas_price,
            gas_boost_factor: self.gas_boost_factor,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl.as_millis() as u64,
            parent_bundle_id: Some(self.id),
            signature: None,
            block_number: None,
            gas_used: None,
            failure_reason: None,
        }
    }

    /// Digest the signer commits to: id, attempt, price and transaction ids
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.id.term.to_le_bytes());
        hasher.update(&self.id.seq.to_le_bytes());
        hasher.update(&self.retry_count.to_le_bytes());
        hasher.update(&self.effective_gas_price().unwrap_or(0).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(&tx.id().0);
        }
        *hasher.finalize().as_bytes()
    }
}
