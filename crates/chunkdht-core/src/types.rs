//! Core data types for chunkdht

use crate::chunk::is_content_hash;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Network address of a peer's HTTP endpoint
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL for HTTP calls to this peer
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddr({}:{})", self.host, self.port)
    }
}

impl FromStr for PeerAddr {
    type Err = Error;

    /// Parse `host:port`
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port in '{}'", s)))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host in '{}'", s)));
        }
        let port = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port in '{}'", s)))?;
        Ok(Self::new(host, port))
    }
}

/// Value stored in the DHT under a chunk hash: the peers that hold the chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peers: Vec<PeerAddr>,
}

impl PeerRecord {
    pub fn new(peers: Vec<PeerAddr>) -> Self {
        Self { peers }
    }

    /// Interpret a raw DHT value as a peer record.
    ///
    /// Malformed entries are skipped. Returns `None` for anything that is not
    /// a `{peers: [...]}` object with at least one well-formed entry.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let peers: Vec<PeerAddr> = value
            .get("peers")?
            .as_array()?
            .iter()
            .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
            .collect();
        if peers.is_empty() {
            return None;
        }
        Some(Self { peers })
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "peers": self.peers })
    }
}

/// Ordered description of how to reassemble a file from content-addressed chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Output file name
    pub file_id: String,
    /// Number of chunks
    pub total_chunks: u32,
    /// SHA-256 hex digest of each chunk, in file order
    pub chunk_hashes: Vec<String>,
    /// Nominal chunk size in bytes (the last chunk may be shorter)
    pub chunk_size: u32,
    /// Total file size in bytes, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl Manifest {
    /// Check the structural invariants before any network traffic is spent on it
    pub fn validate(&self) -> Result<()> {
        if self.file_id.is_empty() {
            return Err(Error::InvalidManifest("empty fileId".to_string()));
        }
        if self.file_id.contains(['/', '\\']) || self.file_id == "." || self.file_id == ".." {
            return Err(Error::InvalidManifest(format!(
                "fileId '{}' is not a plain file name",
                self.file_id
            )));
        }
        if self.chunk_hashes.len() != self.total_chunks as usize {
            return Err(Error::InvalidManifest(format!(
                "totalChunks is {} but {} hashes are listed",
                self.total_chunks,
                self.chunk_hashes.len()
            )));
        }
        if let Some((index, hash)) = self
            .chunk_hashes
            .iter()
            .enumerate()
            .find(|(_, h)| !is_content_hash(h))
        {
            return Err(Error::InvalidManifest(format!(
                "chunk {} has malformed hash '{}'",
                index, hash
            )));
        }
        Ok(())
    }

    /// Load a manifest from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let manifest: Manifest = serde_json::from_str(&content)?;
        Ok(manifest)
    }

    /// Write the manifest as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
