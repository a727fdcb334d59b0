//! Settlement collaborators
//!
//! The bundler only talks to the settlement layer through these traits.
//! The default implementations log what would be settled and hand out
//! synthetic block numbers.

use crate::bundle::Bundle;
use crate::error::SettlementError;
use async_trait::async_trait;
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey};
use sequencer_types::TransactionId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Result of a successful settlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    pub block_number: u64,
    pub gas_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GasStrategy {
    Slow,
    #[default]
    Standard,
    Fast,
}

#[async_trait]
pub trait SettlementSubmitter: Send + Sync {
    async fn submit(&self, bundle: &Bundle) -> Result<SettlementReceipt, SettlementError>;

    /// Whether a transaction already landed in some settled bundle
    async fn is_settled(&self, tx: &TransactionId) -> bool;
}

#[async_trait]
pub trait GasPriceOracle: Send + Sync {
    async fn get_optimal_gas_price(&self, strategy: GasStrategy) -> Result<u64, SettlementError>;
}

pub trait BundleSigner: Send + Sync {
    fn sign(&self, digest: &[u8; 32]) -> Vec<u8>;
    fn public_key(&self) -> [u8; 32];
}

pub trait AlertSink: Send + Sync {
    fn bundle_failed(&self, bundle: &Bundle, reason: &str);
}

/// Settlement stub: logs the bundle and records its transactions as settled
pub struct LoggingSubmitter {
    next_block: AtomicU64,
    settled: DashMap<TransactionId, u64>,
    /// Submissions left to fail before succeeding again
    failures: AtomicU32,
    submissions: AtomicU64,
}

impl LoggingSubmitter {
    pub fn new() -> Self {
        Self {
            next_block: AtomicU64::new(1),
            settled: DashMap::new(),
            failures: AtomicU32::new(0),
            submissions: AtomicU64::new(0),
        }
    }

    /// Make the next `n` submissions fail
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    pub fn settled_block(&self, tx: &TransactionId) -> Option<u64> {
        self.settled.get(tx).map(|b| *b)
    }
}

impl Default for LoggingSubmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettlementSubmitter for LoggingSubmitter {
    async fn submit(&self, bundle: &Bundle) -> Result<SettlementReceipt, SettlementError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            tracing::debug!("Settlement refusing bundle {} (injected failure)", bundle.id);
            return Err(SettlementError::Rejected("injected failure".to_string()));
        }

        let block_number = self.next_block.fetch_add(1, Ordering::SeqCst);
        for tx in &bundle.transactions {
            self.settled.insert(tx.id(), block_number);
        }
        tracing::info!(
            "Would settle bundle {} ({} txs, gas {}, price {:?}) in block {}",
            bundle.id,
            bundle.transaction_count(),
            bundle.current_gas,
            bundle.effective_gas_price(),
            block_number
        );
        Ok(SettlementReceipt {
            block_number,
            gas_used: bundle.current_gas,
        })
    }

    async fn is_settled(&self, tx: &TransactionId) -> bool {
        self.settled.contains_key(tx)
    }
}

/// Oracle quoting a fixed base price scaled by strategy
pub struct FixedGasOracle {
    base_price: u64,
}

impl FixedGasOracle {
    pub fn new(base_price: u64) -> Self {
        Self { base_price }
    }
}

impl Default for FixedGasOracle {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl GasPriceOracle for FixedGasOracle {
    async fn get_optimal_gas_price(&self, strategy: GasStrategy) -> Result<u64, SettlementError> {
        let multiplier = match strategy {
            GasStrategy::Slow => 0.8,
            GasStrategy::Standard => 1.0,
            GasStrategy::Fast => 1.5,
        };
        Ok((self.base_price as f64 * multiplier).round() as u64)
    }
}

pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }
}

impl BundleSigner for Ed25519Signer {
    fn sign(&self, digest: &[u8; 32]) -> Vec<u8> {
        self.key.sign(digest).to_bytes().to_vec()
    }

    fn public_key(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }
}

/// Alerts go to the error log
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn bundle_failed(&self, bundle: &Bundle, reason: &str) {
        tracing::error!(
            "ALERT: bundle {} failed permanently after {} retries ({} txs): {}",
            bundle.id,
            bundle.retry_count,
            bundle.transaction_count(),
            reason
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{BundleId, BundleLimits, SequencedTransaction};
    use ed25519_dalek::{Signature, Verifier};
    use sequencer_types::{AccountId, Transaction, TRANSFER_GAS};
    use std::time::Duration;

    fn bundle_with(n: u64) -> Bundle {
        let limits = BundleLimits {
            max_transactions: 10,
            max_gas: 1_000_000,
            max_retries: 3,
            gas_boost_factor: 1.25,
            ttl: Duration::from_secs(60),
        };
        let mut bundle = Bundle::new(BundleId { term: 1, seq: 0 }, &limits, 0);
        let key = SigningKey::from_bytes(&[3; 32]);
        for i in 0..n {
            let tx = Transaction::signed_at(&key, AccountId::new([4; 32]), 1, i, 0, TRANSFER_GAS, 0);
            bundle.push(SequencedTransaction { index: i + 1, transaction: tx, queued_at: 0 }, 0);
        }
        bundle
    }

    #[tokio::test]
    async fn test_logging_submitter_records_settled() {
        let submitter = LoggingSubmitter::new();
        let bundle = bundle_with(2);

        let receipt = submitter.submit(&bundle).await.unwrap();
        assert_eq!(receipt.block_number, 1);
        assert_eq!(receipt.gas_used, 2 * TRANSFER_GAS);
        for id in bundle.transaction_ids() {
            assert!(submitter.is_settled(&id).await);
        }
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let submitter = LoggingSubmitter::new();
        let bundle = bundle_with(1);
        submitter.fail_next(2);

        assert!(submitter.submit(&bundle).await.is_err());
        assert!(submitter.submit(&bundle).await.is_err());
        assert!(submitter.submit(&bundle).await.is_ok());
        assert_eq!(submitter.submissions(), 3);
    }

    #[tokio::test]
    async fn test_fixed_oracle_strategies() {
        let oracle = FixedGasOracle::new(100);
        assert_eq!(oracle.get_optimal_gas_price(GasStrategy::Slow).await.unwrap(), 80);
        assert_eq!(oracle.get_optimal_gas_price(GasStrategy::Standard).await.unwrap(), 100);
        assert_eq!(oracle.get_optimal_gas_price(GasStrategy::Fast).await.unwrap(), 150);
    }

    #[test]
    fn test_signer_signature_verifies() {
        let signer = Ed25519Signer::from_seed([8; 32]);
        let digest = bundle_with(1).digest();
        let signature = Signature::from_slice(&signer.sign(&digest)).unwrap();
        let key = ed25519_dalek::VerifyingKey::from_bytes(&signer.public_key()).unwrap();
        assert!(key.verify(&digest, &signature).is_ok());
    }
}
