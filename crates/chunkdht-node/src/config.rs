//! Node configuration

use chunkdht_dht::{
    BootstrapPeer, DhtConfig, NodeId, DEFAULT_ALPHA, DEFAULT_BUCKET_FACTOR, DEFAULT_K,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `storage_dir`
pub const STORAGE_DIR_ENV: &str = "STORAGE_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address to listen on and advertise
    pub host: String,
    /// Port to listen on (0 picks a free one)
    pub port: u16,
    /// Directory holding chunk blobs
    pub storage_dir: String,
    /// Derive a stable node id from this string instead of a random one
    pub seed: Option<String>,
    /// Nodes to join through
    pub bootstrap: Vec<BootstrapPeer>,
    /// DHT parameters
    pub dht: DhtSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    /// Contacts per reply
    pub k: usize,
    /// Routing table holds `k * bucket_factor` contacts
    pub bucket_factor: usize,
    /// Lookup parallelism
    pub alpha: usize,
    pub rpc_timeout_ms: u64,
    /// Seconds between liveness pings of every contact (0 disables)
    pub refresh_interval_secs: u64,
    /// Contacts unheard of for this long are dropped (0 disables)
    pub contact_ttl_secs: u64,
}

impl Default for DhtSection {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            bucket_factor: DEFAULT_BUCKET_FACTOR,
            alpha: DEFAULT_ALPHA,
            rpc_timeout_ms: 3000,
            refresh_interval_secs: 300,
            contact_ttl_secs: 3600,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7000,
            storage_dir: "~/.chunkdht/node".to_string(),
            seed: None,
            bootstrap: vec![],
            dht: DhtSection::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
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

    /// DHT parameters, with the id derived from `seed` when one is set
    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.dht.k.max(1),
            bucket_factor: self.dht.bucket_factor.max(1),
            alpha: self.dht.alpha.max(1),
            rpc_timeout: self.rpc_timeout(),
            node_id: match &self.seed {
                Some(seed) => NodeId::derive(seed.as_bytes()),
                None => NodeId::random(),
            },
        }
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.dht.rpc_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.dht.refresh_interval_secs > 0).then(|| Duration::from_secs(self.dht.refresh_interval_secs))
    }

    pub fn contact_ttl(&self) -> Option<Duration> {
        (self.dht.contact_ttl_secs > 0).then(|| Duration::from_secs(self.dht.contact_ttl_secs))
    }

    /// Storage directory: the flag wins, then `STORAGE_DIR`, then the file
    pub fn resolve_storage_dir(&self, flag: Option<&str>, env: Option<&str>) -> PathBuf {
        let chosen = flag.or(env).unwrap_or(&self.storage_dir);
        expand_path(chosen)
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
