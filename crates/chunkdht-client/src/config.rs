//! Client configuration

use crate::retrieval::{RetrieveOptions, DEFAULT_CONCURRENCY};
use chunkdht_dht::{BootstrapPeer, DEFAULT_ALPHA};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory retrieved files are written to
    pub output_dir: String,

    /// DHT nodes used to start lookups
    pub bootstrap: Vec<BootstrapPeer>,

    /// Transfer configuration
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum chunks resolved at once
    pub concurrency: usize,
    /// Lookup parallelism
    pub alpha: usize,
    /// Timeout for DHT RPCs in milliseconds
    pub rpc_timeout_ms: u64,
    /// Timeout for chunk downloads in milliseconds
    pub fetch_timeout_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            alpha: DEFAULT_ALPHA,
            rpc_timeout_ms: 3000,
            fetch_timeout_ms: 5000,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: "~/.chunkdht/downloads".to_string(),
            bootstrap: vec![],
            transfer: TransferConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Expand ~ in output_dir path
    pub fn output_dir(&self) -> PathBuf {
        expand_path(&self.output_dir)
    }

    pub fn retrieve_options(&self) -> RetrieveOptions {
        RetrieveOptions {
            concurrency: self.transfer.concurrency,
            alpha: self.transfer.alpha,
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.rpc_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer.fetch_timeout_ms)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
