//! Sequencer Bundler - settlement bundling and node orchestration
//!
//! Handles everything between the applied transaction feed and settlement:
//! - Packing applied transactions into gas-bounded bundles
//! - Submitting bundles with compounding gas-price retries
//! - Wiring one sequencer node together (`DistributedSequencer`)

pub mod bundle;
pub mod bundler;
pub mod error;
pub mod policy;
pub mod sequencer;
pub mod settlement;

#[cfg(test)]
mod tests;

pub use bundle::{Bundle, BundleId, BundleLimits, BundleStatus, SequencedTransaction};
pub use bundler::{BundlerConfig, BundlerStats, SubmitOutcome, TransactionBundler, TxStatus};
pub use error::{BundlerError, SequencerError, SettlementError};
pub use policy::OrderingStrategy;
pub use sequencer::{DistributedSequencer, SequencerBuilder, SequencerStats, TransactionReceipt};
pub use settlement::{
    AlertSink, BundleSigner, Ed25519Signer, FixedGasOracle, GasPriceOracle, GasStrategy, LogAlertSink,
    LoggingSubmitter, SettlementReceipt, SettlementSubmitter,
};
