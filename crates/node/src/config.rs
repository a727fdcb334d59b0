//! Node Configuration
//!
//! One JSON file, overridable from the command line, validated once at
//! startup and then split into the per-component configs.

use anyhow::{bail, ensure, Context, Result};
use sequencer_bundler::{BundlerConfig, GasStrategy, OrderingStrategy};
use sequencer_consensus::RaftConfig;
use sequencer_state::SyncConfig;
use sequencer_types::{AccountId, Amount, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: NodeId,
    /// `host:port` of the peer's RPC listener
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// Base58 account id
    pub account: String,
    pub balance: Amount,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// RPC bind address
    pub listen_addr: String,
    pub peers: Vec<PeerConfig>,
    pub data_dir: PathBuf,
    /// Sync from the leader before participating
    pub join: bool,

    // Consensus
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub rpc_timeout_ms: u64,
    pub max_entries_per_append: usize,
    /// Applied entries between state snapshots (0 disables)
    pub snapshot_interval: u64,

    // Bundling
    pub max_transactions_per_bundle: usize,
    pub min_transactions_to_finalize: usize,
    pub max_bundle_age_ms: u64,
    pub max_gas_per_bundle: u64,
    pub max_retries: u32,
    pub gas_price_boost_factor: f64,
    pub submission_timeout_ms: u64,
    pub bundle_ttl_ms: u64,
    pub bundle_retention_ms: u64,
    pub bundle_tick_ms: u64,
    pub gas_strategy: GasStrategy,
    pub ordering: OrderingStrategy,
    /// Base price quoted by the fixed gas oracle
    pub base_gas_price: u64,

    // Synchronization
    pub sync_timeout_ms: u64,
    pub sync_retry_backoff_ms: u64,

    pub genesis: Vec<GenesisAccount>,
    /// Base58 32-byte seed of the bundle signing key; random when absent
    pub signing_key_seed: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let raft = RaftConfig::default();
        let bundler = BundlerConfig::default();
        let sync = SyncConfig::default();
        Self {
            node_id: 1,
            listen_addr: "127.0.0.1:7001".to_string(),
            peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            join: false,
            election_timeout_min_ms: raft.election_timeout_min.as_millis() as u64,
            election_timeout_max_ms: raft.election_timeout_max.as_millis() as u64,
            heartbeat_interval_ms: raft.heartbeat_interval.as_millis() as u64,
            rpc_timeout_ms: raft.rpc_timeout.as_millis() as u64,
            max_entries_per_append: raft.max_entries_per_append,
            snapshot_interval: sequencer_state::DEFAULT_SNAPSHOT_INTERVAL,
            max_transactions_per_bundle: bundler.max_transactions_per_bundle,
            min_transactions_to_finalize: bundler.min_transactions_to_finalize,
            max_bundle_age_ms: bundler.max_bundle_age.as_millis() as u64,
            max_gas_per_bundle: bundler.max_gas_per_bundle,
            max_retries: bundler.max_retries,
            gas_price_boost_factor: bundler.gas_price_boost_factor,
            submission_timeout_ms: bundler.submission_timeout.as_millis() as u64,
            bundle_ttl_ms: bundler.bundle_ttl.as_millis() as u64,
            bundle_retention_ms: bundler.bundle_retention.as_millis() as u64,
            bundle_tick_ms: bundler.tick_interval.as_millis() as u64,
            gas_strategy: bundler.gas_strategy,
            ordering: bundler.ordering,
            base_gas_price: 20,
            sync_timeout_ms: sync.sync_timeout.as_millis() as u64,
            sync_retry_backoff_ms: sync.retry_backoff.as_millis() as u64,
            genesis: Vec::new(),
            signing_key_seed: None,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config file {:?}", path))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for peer in &self.peers {
            ensure!(peer.id != self.node_id, "peer list contains this node ({})", self.node_id);
            ensure!(seen.insert(peer.id), "duplicate peer id {}", peer.id);
            ensure!(!peer.addr.is_empty(), "peer {} has no address", peer.id);
        }

        ensure!(self.heartbeat_interval_ms > 0, "heartbeatIntervalMs must be positive");
        ensure!(
            self.heartbeat_interval_ms < self.election_timeout_min_ms,
            "heartbeatIntervalMs ({}) must be below electionTimeoutMinMs ({})",
            self.heartbeat_interval_ms,
            self.election_timeout_min_ms
        );
        ensure!(
            self.election_timeout_min_ms <= self.election_timeout_max_ms,
            "electionTimeoutMinMs ({}) exceeds electionTimeoutMaxMs ({})",
            self.election_timeout_min_ms,
            self.election_timeout_max_ms
        );
        ensure!(self.rpc_timeout_ms > 0, "rpcTimeoutMs must be positive");
        ensure!(self.max_entries_per_append > 0, "maxEntriesPerAppend must be positive");

        ensure!(self.max_transactions_per_bundle > 0, "maxTransactionsPerBundle must be positive");
        ensure!(self.max_gas_per_bundle > 0, "maxGasPerBundle must be positive");
        ensure!(
            self.min_transactions_to_finalize > 0
                && self.min_transactions_to_finalize <= self.max_transactions_per_bundle,
            "minTransactionsToFinalize ({}) must be within 1..={}",
            self.min_transactions_to_finalize,
            self.max_transactions_per_bundle
        );
        ensure!(
            self.max_bundle_age_ms < self.bundle_ttl_ms,
            "maxBundleAgeMs ({}) must be below bundleTtlMs ({})",
            self.max_bundle_age_ms,
            self.bundle_ttl_ms
        );
        ensure!(
            self.gas_price_boost_factor >= 1.0,
            "gasPriceBoostFactor must be at least 1.0, got {}",
            self.gas_price_boost_factor
        );
        ensure!(self.submission_timeout_ms > 0, "submissionTimeoutMs must be positive");
        ensure!(self.bundle_tick_ms > 0, "bundleTickMs must be positive");
        ensure!(self.base_gas_price > 0, "baseGasPrice must be positive");
        ensure!(self.sync_timeout_ms > 0, "syncTimeoutMs must be positive");
        ensure!(
            !self.join || !self.peers.is_empty(),
            "a joining node needs at least one peer"
        );

        self.genesis_balances()?;
        self.signing_seed()?;
        Ok(())
    }

    pub fn peer_addrs(&self) -> HashMap<NodeId, String> {
        self.peers.iter().map(|p| (p.id, p.addr.clone())).collect()
    }

    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            node_id: self.node_id,
            peers: self.peers.iter().map(|p| p.id).collect(),
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            max_entries_per_append: self.max_entries_per_append,
            join_as_observer: self.join,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            peers: self.peers.iter().map(|p| p.id).collect(),
            sync_timeout: Duration::from_millis(self.sync_timeout_ms),
            retry_backoff: Duration::from_millis(self.sync_retry_backoff_ms),
        }
    }

    pub fn bundler_config(&self) -> BundlerConfig {
        BundlerConfig {
            max_transactions_per_bundle: self.max_transactions_per_bundle,
            min_transactions_to_finalize: self.min_transactions_to_finalize,
            max_bundle_age: Duration::from_millis(self.max_bundle_age_ms),
            max_gas_per_bundle: self.max_gas_per_bundle,
            max_retries: self.max_retries,
            gas_price_boost_factor: self.gas_price_boost_factor,
            submission_timeout: Duration::from_millis(self.submission_timeout_ms),
            bundle_ttl: Duration::from_millis(self.bundle_ttl_ms),
            bundle_retention: Duration::from_millis(self.bundle_retention_ms),
            tick_interval: Duration::from_millis(self.bundle_tick_ms),
            gas_strategy: self.gas_strategy,
            ordering: self.ordering,
        }
    }

    pub fn genesis_balances(&self) -> Result<Vec<(AccountId, Amount)>> {
        let mut seen = HashSet::new();
        let mut balances = Vec::with_capacity(self.genesis.len());
        for entry in &self.genesis {
            let account: AccountId = entry
                .account
                .parse()
                .with_context(|| format!("genesis account {:?}", entry.account))?;
            ensure!(seen.insert(account), "genesis lists {} twice", entry.account);
            balances.push((account, entry.balance));
        }
        Ok(balances)
    }

    pub fn signing_seed(&self) -> Result<Option<[u8; 32]>> {
        let Some(encoded) = &self.signing_key_seed else {
            return Ok(None);
        };
        let bytes = bs58::decode(encoded)
            .into_vec()
            .context("signingKeySeed is not base58")?;
        match <[u8; 32]>::try_from(bytes.as_slice()) {
            Ok(seed) => Ok(Some(seed)),
            Err(_) => bail!("signingKeySeed must decode to 32 bytes, got {}", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn three_nodes() -> NodeConfig {
        NodeConfig {
            node_id: 1,
            peers: vec![
                PeerConfig { id: 2, addr: "127.0.0.1:7002".to_string() },
                PeerConfig { id: 3, addr: "127.0.0.1:7003".to_string() },
            ],
            ..NodeConfig::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(NodeConfig::default().validate().is_ok());
        assert!(three_nodes().validate().is_ok());
    }

    #[test]
    fn test_load_camel_case_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "nodeId": 2,
                "listenAddr": "0.0.0.0:9002",
                "peers": [{{"id": 1, "addr": "10.0.0.1:9001"}}],
                "heartbeatIntervalMs": 50,
                "gasStrategy": "fast",
                "ordering": "feePriority",
                "genesis": [{{"account": "{}", "balance": 500}}]
            }}"#,
            AccountId::new([7; 32])
        )
        .unwrap();

        let config = NodeConfig::load(file.path()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert_eq!(config.gas_strategy, GasStrategy::Fast);
        assert_eq!(config.ordering, OrderingStrategy::FeePriority);
        assert_eq!(config.max_transactions_per_bundle, 100);
        assert_eq!(config.genesis_balances().unwrap(), vec![(AccountId::new([7; 32]), 500)]);
        assert_eq!(config.raft_config().peers, vec![1]);
    }

    #[test]
    fn test_rejects_bad_peers() {
        let mut config = three_nodes();
        config.peers.push(PeerConfig { id: 1, addr: "x:1".to_string() });
        assert!(config.validate().is_err());

        let mut config = three_nodes();
        config.peers.push(PeerConfig { id: 2, addr: "x:1".to_string() });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_timing_and_limits() {
        let cases: Vec<fn(&mut NodeConfig)> = vec![
            |c| c.heartbeat_interval_ms = c.election_timeout_min_ms,
            |c| c.election_timeout_max_ms = c.election_timeout_min_ms - 1,
            |c| c.min_transactions_to_finalize = c.max_transactions_per_bundle + 1,
            |c| c.max_bundle_age_ms = c.bundle_ttl_ms,
            |c| c.gas_price_boost_factor = 0.9,
            |c| c.max_gas_per_bundle = 0,
            |c| c.signing_key_seed = Some("abc".to_string()),
        ];
        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = three_nodes();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {} should fail", i);
        }
    }

    #[test]
    fn test_signing_seed_decodes() {
        let mut config = three_nodes();
        config.signing_key_seed = Some(bs58::encode([9u8; 32]).into_string());
        assert_eq!(config.signing_seed().unwrap(), Some([9u8; 32]));
    }
}
