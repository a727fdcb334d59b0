//! Sequencer Node
//!
//! Main entry point for one member of the replicated sequencer cluster.
//! The raft log lives in sled under the data directory; peers talk over
//! websockets.

use anyhow::{Context, Result};
use clap::Parser;
use sequencer_bundler::{DistributedSequencer, Ed25519Signer, FixedGasOracle};
use sequencer_consensus::{RpcHandler, RpcServer, SledLogStorage, WsTransport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::{NodeConfig, PeerConfig};

/// Replicated L2 transaction sequencer
#[derive(Parser, Debug)]
#[command(name = "sequencer")]
#[command(about = "Raft-replicated L2 transaction sequencer", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the node id
    #[arg(long)]
    node_id: Option<u64>,

    /// Override the RPC bind address
    #[arg(long)]
    listen_addr: Option<String>,

    /// Peer as `id=host:port` (repeatable, replaces the configured peers)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerConfig>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Join a running cluster through snapshot sync
    #[arg(long)]
    join: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Seconds between stats log lines (0 disables)
    #[arg(long, default_value = "30")]
    stats_interval: u64,
}

fn parse_peer(raw: &str) -> Result<PeerConfig, String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {:?}", raw))?;
    let id = id
        .trim()
        .parse()
        .map_err(|_| format!("invalid peer id {:?}", id))?;
    Ok(PeerConfig {
        id,
        addr: addr.trim().to_string(),
    })
}

impl Args {
    fn resolve_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(addr) = &self.listen_addr {
            config.listen_addr = addr.clone();
        }
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.join {
            config.join = true;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.resolve_config()?;
    run(config, args.stats_interval).await
}

async fn run(config: NodeConfig, stats_interval: u64) -> Result<()> {
    tracing::info!("Starting sequencer node {}", config.node_id);
    tracing::info!("  Listen address: {}", config.listen_addr);
    tracing::info!("  Peers: {:?}", config.peers);
    tracing::info!("  Data directory: {:?}", config.data_dir);
    tracing::info!(
        "  Election timeout: {}-{}ms, heartbeat {}ms",
        config.election_timeout_min_ms,
        config.election_timeout_max_ms,
        config.heartbeat_interval_ms
    );
    tracing::info!(
        "  Bundles: up to {} txs / {} gas, {:?} ordering, {:?} gas",
        config.max_transactions_per_bundle,
        config.max_gas_per_bundle,
        config.ordering,
        config.gas_strategy
    );
    if config.join {
        tracing::info!("  Joining an existing cluster");
    }

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {:?}", config.data_dir))?;
    let storage = SledLogStorage::open(config.data_dir.join("raft"), config.node_id)
        .context("opening raft log storage")?;

    let raft_config = config.raft_config();
    let transport = Arc::new(WsTransport::new(
        config.node_id,
        config.peer_addrs(),
        raft_config.rpc_timeout,
    ));
    let signer = match config.signing_seed()? {
        Some(seed) => Ed25519Signer::from_seed(seed),
        None => {
            tracing::warn!("No signingKeySeed configured, using an ephemeral bundle signing key");
            Ed25519Signer::generate()
        }
    };

    let sequencer = DistributedSequencer::builder()
        .raft_config(raft_config)
        .bundler_config(config.bundler_config())
        .sync_config(config.sync_config())
        .genesis(config.genesis_balances()?)
        .snapshot_interval(config.snapshot_interval)
        .join(config.join)
        .storage(Arc::new(storage))
        .transport(transport)
        .gas_oracle(Arc::new(FixedGasOracle::new(config.base_gas_price)))
        .signer(Arc::new(signer))
        .build()
        .context("building sequencer")?;

    let handler: Arc<dyn RpcHandler> = sequencer.clone();
    let bound = RpcServer::start(&config.listen_addr, handler)
        .await
        .with_context(|| format!("binding RPC listener on {}", config.listen_addr))?;
    sequencer.start().context("starting sequencer")?;

    tracing::info!("Sequencer node {} running on {}", config.node_id, bound);
    tracing::info!("Press Ctrl+C to stop.");

    let stats_task = (stats_interval > 0).then(|| {
        let sequencer = sequencer.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = sequencer.stats();
                tracing::info!(
                    "Node {}: leader={} term={} commit={} applied={} received={} forwarded={} bundles confirmed={} failed={}",
                    stats.node_id,
                    stats.is_leader,
                    stats.consensus.current_term,
                    stats.consensus.commit_index,
                    stats.last_applied_index,
                    stats.transactions_received,
                    stats.transactions_forwarded,
                    stats.bundler.bundles_confirmed,
                    stats.bundler.bundles_failed
                );
            }
        })
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    if let Some(task) = stats_task {
        task.abort();
    }
    match serde_json::to_string(&sequencer.stats()) {
        Ok(stats) => tracing::info!("Final stats: {}", stats),
        Err(e) => tracing::warn!("Could not encode final stats: {}", e),
    }
    sequencer.shutdown();

    tracing::info!("Sequencer node stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_peer() {
        let peer = parse_peer("3=10.0.0.3:7003").unwrap();
        assert_eq!(peer, PeerConfig { id: 3, addr: "10.0.0.3:7003".to_string() });
        assert!(parse_peer("10.0.0.3:7003").is_err());
        assert!(parse_peer("x=10.0.0.3:7003").is_err());
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "sequencer",
            "--node-id",
            "2",
            "--peer",
            "1=127.0.0.1:7001",
            "--peer",
            "3=127.0.0.1:7003",
            "--join",
        ]);
        let config = args.resolve_config().unwrap();
        assert_eq!(config.node_id, 2);
        assert_eq!(config.raft_config().peers, vec![1, 3]);
        assert!(config.join);
        assert!(config.raft_config().join_as_observer);
    }
}
