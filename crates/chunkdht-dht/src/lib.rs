//! chunkdht DHT - Kademlia-style chunk location over HTTP
//!
//! This crate provides the distributed hash table that maps chunk content
//! hashes to the peers holding them: node identities and the XOR metric, a
//! distance-ordered routing table, the peer RPC seam, the iterative lookup
//! protocol, and the node service that answers RPCs and serves verified
//! chunk bytes.

pub mod blobs;
pub mod http;
pub mod id;
pub mod lookup;
pub mod node;
pub mod routing;
pub mod rpc;
pub mod storage;

pub use id::{distance, Distance, NodeId};
pub use node::DhtNode;
pub use routing::{BootstrapPeer, Contact, RoutingTable};
pub use rpc::{FindValueOutcome, PeerRpc};

use std::time::Duration;
use thiserror::Error;

/// Contacts returned per find_node / find_value reply
pub const DEFAULT_K: usize = 20;
/// Routing table capacity multiplier over `k`
pub const DEFAULT_BUCKET_FACTOR: usize = 8;
/// Lookup fan-out per round
pub const DEFAULT_ALPHA: usize = 3;
/// Per-RPC timeout
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Error, Debug)]
pub enum DhtError {
    /// Connection refused, timeout, or error status from a remote peer
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored bytes no longer hash to their key
    #[error("Stored data corrupted: key {key}, content hashes to {actual}")]
    DataCorruption { key: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhtError>;

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Contacts returned per reply
    pub k: usize,
    /// Routing table holds at most `k * bucket_factor` contacts
    pub bucket_factor: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Timeout applied to each outgoing RPC
    pub rpc_timeout: Duration,
    /// Node ID (160 bits)
    pub node_id: NodeId,
}

impl DhtConfig {
    /// Configuration with a deterministic id derived from `seed`
    pub fn with_seed(seed: &str) -> Self {
        Self {
            node_id: NodeId::derive(seed.as_bytes()),
            ..Self::default()
        }
    }

    /// Maximum routing table size
    pub fn table_capacity(&self) -> usize {
        self.k.saturating_mul(self.bucket_factor).max(1)
    }
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            bucket_factor: DEFAULT_BUCKET_FACTOR,
            alpha: DEFAULT_ALPHA,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            node_id: NodeId::random(),
        }
    }
}

/// First eight characters of a key, for log lines
pub(crate) fn short_key(key: &str) -> &str {
    key.char_indices().nth(8).map_or(key, |(i, _)| &key[..i])
}

/// Current time as milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_key_respects_char_boundaries() {
        assert_eq!(short_key("abcdef0123456789"), "abcdef01");
        assert_eq!(short_key("abc"), "abc");
        assert_eq!(short_key(""), "");
        assert_eq!(short_key("€€€"), "€€€");
        assert_eq!(short_key("ü€ü€ü€ü€ü€"), "ü€ü€ü€ü€");
    }
}
