//! chunkdht Node - DHT node server
//!
//! Runs one addressable DHT node: answers RPCs over HTTP, serves chunk
//! blobs, joins through its bootstrap list and periodically checks the
//! liveness of its contacts.

use anyhow::{Context, Result};
use chunkdht_core::PeerAddr;
use chunkdht_dht::http::{serve, HttpRpc};
use chunkdht_dht::{BootstrapPeer, DhtNode};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::{expand_path, NodeConfig, STORAGE_DIR_ENV};

#[derive(Parser)]
#[command(name = "chunkdht-node")]
#[command(about = "chunkdht DHT node server", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.chunkdht/node.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Host to listen on and advertise (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bootstrap nodes as a JSON array, e.g. '[{"host":"127.0.0.1","port":7001}]'
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Chunk storage directory (overrides STORAGE_DIR and config)
    #[arg(short, long)]
    storage_dir: Option<String>,

    /// Seed for a stable node id (overrides config)
    #[arg(long)]
    seed: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config_path = expand_path(&cli.config);
    let mut config = NodeConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(seed) = cli.seed {
        config.seed = Some(seed);
    }
    if let Some(raw) = cli.bootstrap.as_deref() {
        config.bootstrap = serde_json::from_str::<Vec<BootstrapPeer>>(raw)
            .context("--bootstrap must be a JSON array of {host, port, id?} objects")?;
    }
    let env_storage = std::env::var(STORAGE_DIR_ENV).ok();
    let storage_dir = config.resolve_storage_dir(cli.storage_dir.as_deref(), env_storage.as_deref());

    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    let port = listener.local_addr()?.port();
    let addr = PeerAddr::new(config.host.clone(), port);

    let node = DhtNode::open(config.dht_config(), addr.clone(), storage_dir).await?;
    let rpc = Arc::new(HttpRpc::new(node.config().rpc_timeout)?);

    tracing::info!("Starting chunkdht node {} on {}", node.id(), addr);

    if !config.bootstrap.is_empty() {
        let node = node.clone();
        let rpc = Arc::clone(&rpc);
        let bootstrap = config.bootstrap.clone();
        tokio::spawn(async move {
            let size = node.join(rpc.as_ref(), &bootstrap).await;
            tracing::info!("Joined network: {} contacts in routing table", size);
        });
    }

    if let Some(interval) = config.refresh_interval() {
        tokio::spawn(maintain(node.clone(), Arc::clone(&rpc), interval, config.contact_ttl()));
    }

    serve(node, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await?;

    Ok(())
}

/// Periodic liveness pass over the routing table
async fn maintain(node: DhtNode, rpc: Arc<HttpRpc>, every: Duration, ttl: Option<Duration>) {
    let mut ticker = tokio::time::interval(every);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Some(ttl) = ttl {
            node.prune_stale(ttl).await;
        }
        let report = node.refresh_contacts(rpc.as_ref()).await;
        tracing::debug!(
            "Refreshed contacts: {} alive, {} evicted",
            report.alive,
            report.evicted.len()
        );
    }
}
