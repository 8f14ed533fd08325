//! chunkdht - retrieve and publish chunked files located through the DHT

use anyhow::{bail, Context, Result};
use chunkdht_client::config::{expand_path, Config};
use chunkdht_client::{publish_file, PublishOptions, Retriever};
use chunkdht_core::{Manifest, PeerAddr, DEFAULT_CHUNK_SIZE};
use chunkdht_dht::http::HttpRpc;
use chunkdht_dht::{lookup, BootstrapPeer, Contact, PeerRpc, DEFAULT_K};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chunkdht")]
#[command(about = "Chunked file retrieval over a Kademlia-style DHT", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.chunkdht/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Bootstrap nodes as a JSON array, e.g. '[{"host":"127.0.0.1","port":7001}]'
    /// (overrides config)
    #[arg(short, long)]
    bootstrap: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve the file described by a manifest
    Retrieve {
        /// Path to the manifest JSON file
        #[arg(required = true)]
        manifest: String,

        /// Output directory (overrides config)
        #[arg(short, long)]
        output_dir: Option<String>,

        /// Maximum chunks resolved at once (overrides config)
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Upload a file's chunks to storage nodes and announce them in the DHT
    Publish {
        /// Path to the file to publish
        #[arg(required = true)]
        file: String,

        /// Storage nodes as a JSON array of {host, port}
        #[arg(short, long, required = true)]
        storage: String,

        /// Chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Where to write the manifest (defaults to <file>.manifest.json)
        #[arg(short, long)]
        manifest: Option<String>,
    },

    /// Look up a key in the DHT and print its value
    Lookup {
        #[arg(required = true)]
        key: String,
    },

    /// Ping a node and print its id
    Ping {
        /// Node address as host:port
        #[arg(required = true)]
        addr: String,
    },

    /// Initialize configuration
    Init,
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
    let mut config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;
    if let Some(raw) = cli.bootstrap.as_deref() {
        config.bootstrap = parse_json_list(raw, "--bootstrap")?;
    }

    let rpc = Arc::new(HttpRpc::new(config.rpc_timeout())?.with_chunk_timeout(config.fetch_timeout()));

    match cli.command {
        Commands::Retrieve {
            manifest,
            output_dir,
            concurrency,
        } => {
            retrieve(rpc, &config, &manifest, output_dir.as_deref(), concurrency).await?;
        }
        Commands::Publish {
            file,
            storage,
            chunk_size,
            manifest,
        } => {
            let storage: Vec<PeerAddr> = parse_json_list(&storage, "--storage")?;
            publish(rpc.as_ref(), &config, &file, &storage, chunk_size, manifest.as_deref()).await?;
        }
        Commands::Lookup { key } => {
            lookup_key(rpc.as_ref(), &config, &key).await?;
        }
        Commands::Ping { addr } => {
            let addr: PeerAddr = addr.parse()?;
            let id = rpc.ping(&addr).await?;
            println!("{} is up, id {}", addr, id);
        }
        Commands::Init => {
            init_config(&config_path)?;
        }
    }

    Ok(())
}

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: &str, flag: &str) -> Result<Vec<T>> {
    serde_json::from_str(raw).with_context(|| format!("{} must be a JSON array of {{host, port}} objects", flag))
}

async fn bootstrap_contacts<R: PeerRpc + ?Sized>(rpc: &R, config: &Config) -> Result<Vec<Contact>> {
    if config.bootstrap.is_empty() {
        bail!("No bootstrap nodes configured. Use --bootstrap or add [[bootstrap]] entries to the config.");
    }
    let contacts = lookup::resolve_bootstrap(rpc, &config.bootstrap, None).await;
    if contacts.is_empty() {
        bail!("None of the {} bootstrap nodes answered", config.bootstrap.len());
    }
    Ok(contacts)
}

async fn retrieve(
    rpc: Arc<HttpRpc>,
    config: &Config,
    manifest_path: &str,
    output_dir: Option<&str>,
    concurrency: Option<usize>,
) -> Result<()> {
    let manifest = Manifest::load(Path::new(manifest_path))
        .with_context(|| format!("Failed to read manifest {}", manifest_path))?;
    let output_dir = output_dir.map(expand_path).unwrap_or_else(|| config.output_dir());

    let mut options = config.retrieve_options();
    if let Some(concurrency) = concurrency {
        options.concurrency = concurrency;
    }

    let contacts = bootstrap_contacts(rpc.as_ref(), config).await?;
    let retriever = Retriever::new(rpc)
        .with_options(options)
        .with_progress(|done, total| {
            tracing::info!("Progress: {}/{} chunks", done, total);
        });

    let path = retriever.retrieve_file(&manifest, &contacts, &output_dir).await?;
    println!("Retrieved {} to {}", manifest.file_id, path.display());
    Ok(())
}

async fn publish(
    rpc: &HttpRpc,
    config: &Config,
    file: &str,
    storage: &[PeerAddr],
    chunk_size: usize,
    manifest_out: Option<&str>,
) -> Result<()> {
    let path = Path::new(file);
    if !path.exists() {
        bail!("File not found: {}", path.display());
    }

    let contacts = bootstrap_contacts(rpc, config).await?;
    let options = PublishOptions {
        chunk_size,
        alpha: config.transfer.alpha,
        k: DEFAULT_K,
    };
    let manifest = publish_file(rpc, path, storage, &contacts, &options).await?;

    let manifest_path = manifest_out
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.manifest.json", file)));
    manifest.save(&manifest_path)?;

    println!("Published {} ({} chunks)", manifest.file_id, manifest.total_chunks);
    println!("Manifest: {}", manifest_path.display());
    Ok(())
}

async fn lookup_key(rpc: &HttpRpc, config: &Config, key: &str) -> Result<()> {
    let contacts = bootstrap_contacts(rpc, config).await?;
    match lookup::find_value(rpc, &contacts, key, config.transfer.alpha).await {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => bail!("No value found for {}", key),
    }
    Ok(())
}

fn init_config(path: &Path) -> Result<()> {
    if path.exists() {
        println!("Config file already exists at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let config = Config::default();
    std::fs::write(path, toml::to_string_pretty(&config)?)?;
    std::fs::create_dir_all(config.output_dir())?;

    println!("Created config file at {}", path.display());
    println!("Add [[bootstrap]] entries with the host and port of at least one node.");
    Ok(())
}
