//! Peer RPC abstraction and wire messages
//!
//! [`PeerRpc`] is the single seam between the DHT logic and the network. The
//! HTTP implementation lives in [`crate::http`]; [`mock::MemoryNetwork`]
//! routes calls to in-process nodes for tests and simulations.
//!
//! Every transport-level failure surfaces as [`DhtError::PeerUnreachable`];
//! callers treat it as "no answer".

use crate::id::NodeId;
use crate::routing::Contact;
use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chunkdht_core::PeerAddr;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reply to `ping`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
    pub id: NodeId,
}

/// Body of `store`; a missing key deserializes as empty and is rejected by the node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Value,
}

/// Generic `{ok: true}` acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeRequest {
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindNodeResponse {
    pub ok: bool,
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindValueRequest {
    pub key: String,
}

/// Reply to `find_value`: either `value` or `contacts` is present
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindValueResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contacts: Option<Vec<Contact>>,
}

/// Error body returned with a non-2xx status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

/// Decoded `find_value` answer
#[derive(Debug, Clone, PartialEq)]
pub enum FindValueOutcome {
    Value(Value),
    Contacts(Vec<Contact>),
}

impl From<FindValueResponse> for FindValueOutcome {
    fn from(resp: FindValueResponse) -> Self {
        match resp.value {
            // A JSON null value counts as absent
            Some(value) if !value.is_null() => FindValueOutcome::Value(value),
            _ => FindValueOutcome::Contacts(resp.contacts.unwrap_or_default()),
        }
    }
}

impl From<FindValueOutcome> for FindValueResponse {
    fn from(outcome: FindValueOutcome) -> Self {
        match outcome {
            FindValueOutcome::Value(value) => Self {
                ok: true,
                value: Some(value),
                contacts: None,
            },
            FindValueOutcome::Contacts(contacts) => Self {
                ok: true,
                value: None,
                contacts: Some(contacts),
            },
        }
    }
}

/// Request/response calls to a remote node
#[async_trait]
pub trait PeerRpc: Send + Sync {
    /// Liveness and identity probe
    async fn ping(&self, to: &PeerAddr) -> Result<NodeId>;

    /// Ask a node to hold `key -> value`
    async fn store(&self, to: &PeerAddr, key: &str, value: &Value) -> Result<()>;

    /// Contacts the remote node knows closest to `target`
    async fn find_node(&self, to: &PeerAddr, target: &NodeId) -> Result<Vec<Contact>>;

    /// The stored value for `key`, or closer contacts
    async fn find_value(&self, to: &PeerAddr, key: &str) -> Result<FindValueOutcome>;

    /// Raw chunk bytes from the byte-oriented endpoint
    async fn get_chunk(&self, to: &PeerAddr, hash: &str) -> Result<Bytes>;

    /// Upload chunk bytes to a node's blob store
    async fn put_chunk(&self, to: &PeerAddr, hash: &str, data: Bytes) -> Result<()>;
}

pub mod mock {
    //! In-process network for tests and simulations

    use super::*;
    use crate::node::DhtNode;
    use crate::DhtError;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    /// One recorded outgoing call
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct RecordedCall {
        pub to: PeerAddr,
        pub procedure: &'static str,
        pub key: String,
    }

    /// Routes RPCs to registered [`DhtNode`]s by address
    #[derive(Default)]
    pub struct MemoryNetwork {
        nodes: Mutex<HashMap<PeerAddr, DhtNode>>,
        /// Addresses that refuse every call
        dead: Mutex<HashSet<PeerAddr>>,
        /// Per-address delay before answering
        latency: Mutex<HashMap<PeerAddr, Duration>>,
        /// Bytes served by `get_chunk` regardless of what was asked
        lying: Mutex<HashMap<PeerAddr, Bytes>>,
        calls: Mutex<Vec<RecordedCall>>,
    }

    impl MemoryNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn register(&self, node: &DhtNode) {
            self.nodes
                .lock()
                .unwrap()
                .insert(node.addr().clone(), node.clone());
        }

        pub fn set_dead(&self, addr: &PeerAddr, dead: bool) {
            let mut set = self.dead.lock().unwrap();
            if dead {
                set.insert(addr.clone());
            } else {
                set.remove(addr);
            }
        }

        pub fn set_latency(&self, addr: &PeerAddr, latency: Duration) {
            self.latency.lock().unwrap().insert(addr.clone(), latency);
        }

        /// Make `addr` answer every chunk request with `data`
        pub fn set_lying(&self, addr: &PeerAddr, data: impl Into<Bytes>) {
            self.lying.lock().unwrap().insert(addr.clone(), data.into());
        }

        pub fn calls(&self) -> Vec<RecordedCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_to(&self, procedure: &str) -> Vec<RecordedCall> {
            self.calls()
                .into_iter()
                .filter(|c| c.procedure == procedure)
                .collect()
        }

        /// Record the call, apply latency, then resolve the target node
        async fn reach(&self, to: &PeerAddr, procedure: &'static str, key: &str) -> Result<DhtNode> {
            self.calls.lock().unwrap().push(RecordedCall {
                to: to.clone(),
                procedure,
                key: key.to_string(),
            });

            let delay = self.latency.lock().unwrap().get(to).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.dead.lock().unwrap().contains(to) {
                return Err(DhtError::PeerUnreachable(format!("{}: connection refused", to)));
            }

            self.nodes
                .lock()
                .unwrap()
                .get(to)
                .cloned()
                .ok_or_else(|| DhtError::PeerUnreachable(format!("{}: no such host", to)))
        }
    }

    fn unreachable(to: &PeerAddr, err: DhtError) -> DhtError {
        match err {
            DhtError::PeerUnreachable(msg) => DhtError::PeerUnreachable(msg),
            other => DhtError::PeerUnreachable(format!("{}: {}", to, other)),
        }
    }

    #[async_trait]
    impl PeerRpc for MemoryNetwork {
        async fn ping(&self, to: &PeerAddr) -> Result<NodeId> {
            let node = self.reach(to, "ping", "").await?;
            Ok(node.handle_ping())
        }

        async fn store(&self, to: &PeerAddr, key: &str, value: &Value) -> Result<()> {
            let node = self.reach(to, "store", key).await?;
            node.handle_store(key.to_string(), value.clone())
                .await
                .map_err(|e| unreachable(to, e))
        }

        async fn find_node(&self, to: &PeerAddr, target: &NodeId) -> Result<Vec<Contact>> {
            let node = self.reach(to, "find_node", &target.to_hex()).await?;
            Ok(node.handle_find_node(target).await)
        }

        async fn find_value(&self, to: &PeerAddr, key: &str) -> Result<FindValueOutcome> {
            let node = self.reach(to, "find_value", key).await?;
            Ok(node.handle_find_value(key).await)
        }

        async fn get_chunk(&self, to: &PeerAddr, hash: &str) -> Result<Bytes> {
            let node = self.reach(to, "get_chunk", hash).await?;
            let lie = self.lying.lock().unwrap().get(to).cloned();
            if let Some(data) = lie {
                return Ok(data);
            }
            node.handle_get_chunk(hash)
                .await
                .map(Bytes::from)
                .map_err(|e| unreachable(to, e))
        }

        async fn put_chunk(&self, to: &PeerAddr, hash: &str, data: Bytes) -> Result<()> {
            let node = self.reach(to, "put_chunk", hash).await?;
            node.handle_put_chunk(hash, &data)
                .await
                .map_err(|e| unreachable(to, e))
        }
    }
}
