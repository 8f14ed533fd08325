//! DHT node service
//!
//! A [`DhtNode`] is the addressable peer: it owns a routing table, the local
//! key -> value map and a chunk blob store, and answers the RPCs defined in
//! [`crate::rpc`]. The transport in front of it ([`crate::http`] or
//! [`crate::rpc::mock::MemoryNetwork`]) only decodes requests and calls the
//! `handle_*` methods.
//!
//! The routing table and the record map each sit behind their own lock, so
//! concurrent handlers serialize their writes.

use crate::blobs::ChunkStore;
use crate::id::NodeId;
use crate::lookup::{self, LookupTrace};
use crate::routing::{BootstrapPeer, Contact, RoutingTable};
use crate::rpc::{FindValueOutcome, PeerRpc};
use crate::storage::RecordStore;
use crate::{now_millis, short_key, DhtConfig, DhtError, Result};
use chunkdht_core::PeerAddr;
use futures::future::join_all;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

struct NodeState {
    config: DhtConfig,
    contact: Contact,
    routing: RwLock<RoutingTable>,
    records: RwLock<RecordStore>,
    chunks: ChunkStore,
}

/// Outcome of a liveness sweep over the routing table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub alive: usize,
    pub evicted: Vec<NodeId>,
}

/// Shareable handle to one DHT node
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<NodeState>,
}

impl DhtNode {
    /// Create a node listening at `addr` with chunks stored in `storage_dir`.
    ///
    /// The routing table starts out holding only the node itself.
    pub async fn open(
        config: DhtConfig,
        addr: PeerAddr,
        storage_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let chunks = ChunkStore::open(storage_dir).await?;
        let contact = Contact::new(config.node_id, addr);

        let mut routing = RoutingTable::new(config.node_id, config.table_capacity());
        routing.add(contact.clone());

        info!(
            "DHT node {} at {} (chunks in {})",
            config.node_id,
            contact.addr,
            chunks.dir().display()
        );

        Ok(Self {
            inner: Arc::new(NodeState {
                config,
                contact,
                routing: RwLock::new(routing),
                records: RwLock::new(RecordStore::new()),
                chunks,
            }),
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.contact.id
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.inner.contact.addr
    }

    /// This node as a contact other peers can add
    pub fn contact(&self) -> Contact {
        self.inner.contact.clone()
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunks
    }

    fn is_self(&self, contact: &Contact) -> bool {
        contact.id == *self.id() || contact.addr == *self.addr()
    }

    /// Add or refresh a remote contact. Entries naming this node are refused.
    pub async fn add_contact(&self, contact: Contact) -> bool {
        if self.is_self(&contact) {
            return false;
        }
        self.inner.routing.write().await.add(contact)
    }

    /// Snapshot of the routing table
    pub async fn contacts(&self) -> Vec<Contact> {
        self.inner.routing.read().await.all()
    }

    pub async fn has_record(&self, key: &str) -> bool {
        self.inner.records.read().await.contains(key)
    }

    pub async fn record(&self, key: &str) -> Option<Value> {
        self.inner.records.read().await.get(key).cloned()
    }

    /// Seed the table from bootstrap entries, pinging id-less ones to learn
    /// their id. Returns the number of contacts added.
    pub async fn bootstrap<R: PeerRpc + ?Sized>(&self, rpc: &R, peers: &[BootstrapPeer]) -> usize {
        let contacts = lookup::resolve_bootstrap(rpc, peers, Some(self.addr())).await;
        let mut added = 0;
        for contact in contacts {
            if self.add_contact(contact).await {
                added += 1;
            }
        }
        info!("Bootstrapped with {} of {} seed peers", added, peers.len());
        added
    }

    /// Bootstrap, then look up our own id so neighbours learn about us and
    /// we learn about them.
    pub async fn join<R: PeerRpc + ?Sized>(&self, rpc: &R, peers: &[BootstrapPeer]) -> usize {
        self.bootstrap(rpc, peers).await;
        let start = self.remote_closest(self.id()).await;
        let trace = lookup::find_node_traced(
            rpc,
            &start,
            self.id(),
            self.inner.config.alpha,
            self.inner.config.k,
        )
        .await;
        self.absorb(&trace).await;
        self.inner.routing.read().await.len()
    }

    /// Closest known contacts to `target`, excluding ourselves
    async fn remote_closest(&self, target: &NodeId) -> Vec<Contact> {
        let routing = self.inner.routing.read().await;
        let mut closest = routing.closest(target, self.inner.config.k + 1);
        closest.retain(|c| !self.is_self(c));
        closest.truncate(self.inner.config.k);
        closest
    }

    /// Fold the contacts a lookup met into the routing table
    async fn absorb<T>(&self, trace: &LookupTrace<T>) {
        let now = now_millis();
        let mut routing = self.inner.routing.write().await;
        for contact in &trace.responded {
            if !self.is_self(contact) {
                routing.add(contact.clone().with_last_seen(now));
            }
        }
        for contact in &trace.learned {
            if !self.is_self(contact) && !routing.contains(&contact.id) {
                routing.add(contact.clone().with_last_seen(now));
            }
        }
    }

    /// Look a key up, locally first, then across the network
    pub async fn lookup_value<R: PeerRpc + ?Sized>(&self, rpc: &R, key: &str) -> Option<Value> {
        if let Some(value) = self.record(key).await {
            return Some(value);
        }
        let start = self.remote_closest(&NodeId::for_key(key)).await;
        let trace = lookup::find_value_traced(rpc, &start, key, self.inner.config.alpha).await;
        self.absorb(&trace).await;
        trace.result
    }

    /// Store a value locally and on the closest nodes the network knows of
    pub async fn announce<R: PeerRpc + ?Sized>(&self, rpc: &R, key: &str, value: Value) -> Result<usize> {
        self.handle_store(key.to_string(), value.clone()).await?;

        let target = NodeId::for_key(key);
        let start = self.remote_closest(&target).await;
        let trace = lookup::find_node_traced(
            rpc,
            &start,
            &target,
            self.inner.config.alpha,
            self.inner.config.k,
        )
        .await;
        self.absorb(&trace).await;

        let mut closest = trace.result;
        closest.retain(|c| !self.is_self(c));
        if closest.is_empty() {
            closest = start;
        }
        Ok(lookup::store_value(rpc, &closest, key, &value, self.inner.config.alpha).await)
    }

    /// Ping every remote contact; refresh those that answer, evict the rest
    pub async fn refresh_contacts<R: PeerRpc + ?Sized>(&self, rpc: &R) -> RefreshReport {
        let remote: Vec<Contact> = self
            .contacts()
            .await
            .into_iter()
            .filter(|c| !self.is_self(c))
            .collect();

        let replies = join_all(remote.into_iter().map(|contact| async move {
            let reply = rpc.ping(&contact.addr).await;
            (contact, reply)
        }))
        .await;

        let now = now_millis();
        let mut report = RefreshReport::default();
        let mut routing = self.inner.routing.write().await;
        for (contact, reply) in replies {
            match reply {
                Ok(id) if id == contact.id => {
                    routing.add(contact.with_last_seen(now));
                    report.alive += 1;
                }
                Ok(id) => {
                    warn!("Contact {} now answers as {}, evicting", contact.addr, id);
                    routing.remove(&contact.id);
                    report.evicted.push(contact.id);
                }
                Err(e) => {
                    debug!("Evicting unreachable contact {}: {}", contact.addr, e);
                    routing.remove(&contact.id);
                    report.evicted.push(contact.id);
                }
            }
        }
        report
    }

    /// Remove contacts not heard from within `ttl`
    pub async fn prune_stale(&self, ttl: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(ttl.as_millis() as u64);
        let pruned = self.inner.routing.write().await.prune_older_than(cutoff);
        if !pruned.is_empty() {
            debug!("Pruned {} stale contacts", pruned.len());
        }
        pruned.len()
    }

    // RPC handlers

    pub fn handle_ping(&self) -> NodeId {
        *self.id()
    }

    pub async fn handle_store(&self, key: String, value: Value) -> Result<()> {
        if key.is_empty() {
            return Err(DhtError::InvalidRequest("missing key".to_string()));
        }
        debug!("Store {}", short_key(&key));
        self.inner.records.write().await.store(key, value);
        Ok(())
    }

    pub async fn handle_find_node(&self, target: &NodeId) -> Vec<Contact> {
        self.inner
            .routing
            .read()
            .await
            .closest(target, self.inner.config.k)
    }

    pub async fn handle_find_value(&self, key: &str) -> FindValueOutcome {
        if let Some(value) = self.record(key).await {
            return FindValueOutcome::Value(value);
        }
        FindValueOutcome::Contacts(self.handle_find_node(&NodeId::for_key(key)).await)
    }

    pub async fn handle_get_chunk(&self, hash: &str) -> Result<Vec<u8>> {
        self.inner.chunks.get_verified(hash).await
    }

    pub async fn handle_put_chunk(&self, hash: &str, data: &[u8]) -> Result<()> {
        self.inner.chunks.put_verified(hash, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::MemoryNetwork;
    use chunkdht_core::chunk::sha256_hex;
    use serde_json::json;
    use tempfile::TempDir;

    async fn node(dir: &TempDir, seed: &str, port: u16) -> DhtNode {
        DhtNode::open(
            DhtConfig::with_seed(seed),
            PeerAddr::new("127.0.0.1", port),
            dir.path().join(seed),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_table_starts_with_self() {
        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        let contacts = a.contacts().await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].id, *a.id());
        assert_eq!(a.handle_ping(), *a.id());
    }

    #[tokio::test]
    async fn test_store_requires_key() {
        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        assert!(matches!(
            a.handle_store(String::new(), json!(1)).await,
            Err(DhtError::InvalidRequest(_))
        ));
        a.handle_store("k".to_string(), json!(1)).await.unwrap();
        a.handle_store("k".to_string(), json!(2)).await.unwrap();
        assert_eq!(a.record("k").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_store_non_ascii_key_with_debug_logging() {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter("debug")
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        a.handle_store("€€€".to_string(), json!(1)).await.unwrap();
        a.handle_store("€€€€€€€€€€".to_string(), json!(2)).await.unwrap();
        assert_eq!(a.record("€€€").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_find_value_falls_back_to_contacts() {
        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        for i in 0..30u16 {
            a.add_contact(Contact::new(
                NodeId::derive(format!("peer-{}", i).as_bytes()),
                PeerAddr::new("127.0.0.1", 8000 + i),
            ))
            .await;
        }

        match a.handle_find_value("ab").await {
            FindValueOutcome::Contacts(contacts) => assert_eq!(contacts.len(), 20),
            other => panic!("expected contacts, got {:?}", other),
        }

        a.handle_store("ab".to_string(), json!({"peers": []})).await.unwrap();
        assert_eq!(
            a.handle_find_value("ab").await,
            FindValueOutcome::Value(json!({"peers": []}))
        );
    }

    #[tokio::test]
    async fn test_add_contact_refuses_self() {
        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        // Same address under a different id is still us
        let imposter = Contact::new(NodeId::derive(b"other"), a.addr().clone());
        assert!(!a.add_contact(imposter).await);
        assert!(!a.add_contact(a.contact()).await);
        assert_eq!(a.contacts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_chunk_roundtrip_through_handlers() {
        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        let data = b"chunk bytes".to_vec();
        let hash = sha256_hex(&data);

        a.handle_put_chunk(&hash, &data).await.unwrap();
        assert_eq!(a.handle_get_chunk(&hash).await.unwrap(), data);
        assert!(matches!(
            a.handle_get_chunk(&sha256_hex(b"other")).await,
            Err(DhtError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_join_discovers_network() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let seed = node(&dir, "seed", 7000).await;
        net.register(&seed);

        let mut others = Vec::new();
        for i in 1..=4u16 {
            let n = node(&dir, &format!("n{}", i), 7000 + i).await;
            net.register(&n);
            others.push(n);
        }
        let entries: Vec<BootstrapPeer> = others
            .iter()
            .map(|n| BootstrapPeer::from(n.addr().clone()))
            .collect();
        assert_eq!(seed.bootstrap(&net, &entries).await, 4);

        // A newcomer that only knows the seed's address meets everyone
        let newcomer = node(&dir, "newcomer", 7100).await;
        net.register(&newcomer);
        let size = newcomer
            .join(&net, &[BootstrapPeer::from(seed.addr().clone())])
            .await;
        assert_eq!(size, 6);

        let known = newcomer.contacts().await;
        for n in others.iter().chain(std::iter::once(&seed)) {
            assert!(known.iter().any(|c| c.id == *n.id()), "missing {:?}", n.id());
        }
    }

    #[tokio::test]
    async fn test_bootstrap_skips_self_and_dead_peers() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let a = node(&dir, "a", 7001).await;
        let b = node(&dir, "b", 7002).await;
        net.register(&a);
        net.register(&b);

        let peers = vec![
            BootstrapPeer::from(a.addr().clone()),
            BootstrapPeer::from(b.addr().clone()),
            BootstrapPeer::from(PeerAddr::new("127.0.0.1", 9999)),
        ];
        assert_eq!(a.bootstrap(&net, &peers).await, 1);

        let contacts = a.contacts().await;
        assert_eq!(contacts.len(), 2);
        // b was added under its real id, not ours
        assert!(contacts.iter().any(|c| c.id == *b.id()));
    }

    #[tokio::test]
    async fn test_lookup_and_announce_between_nodes() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let a = node(&dir, "a", 7001).await;
        let b = node(&dir, "b", 7002).await;
        let c = node(&dir, "c", 7003).await;
        for n in [&a, &b, &c] {
            net.register(n);
        }
        a.add_contact(b.contact()).await;
        b.add_contact(c.contact()).await;

        let acked = c.announce(&net, "cafe", json!("from-c")).await.unwrap();
        assert_eq!(acked, 0, "c knows nobody yet");

        c.add_contact(b.contact()).await;
        let acked = c.announce(&net, "beef", json!("from-c")).await.unwrap();
        assert!(acked >= 1);

        assert_eq!(a.lookup_value(&net, "beef").await, Some(json!("from-c")));
        assert_eq!(b.record("beef").await, Some(json!("from-c")));

        // Only c holds this one, so a has to go through b's contacts
        c.handle_store("d00d".to_string(), json!("deep")).await.unwrap();
        assert_eq!(a.lookup_value(&net, "d00d").await, Some(json!("deep")));
        assert!(a.contacts().await.iter().any(|x| x.id == *c.id()));
    }

    #[tokio::test]
    async fn test_refresh_evicts_unreachable() {
        let dir = TempDir::new().unwrap();
        let net = MemoryNetwork::new();
        let a = node(&dir, "a", 7001).await;
        let b = node(&dir, "b", 7002).await;
        let c = node(&dir, "c", 7003).await;
        for n in [&a, &b, &c] {
            net.register(n);
        }
        a.add_contact(b.contact()).await;
        a.add_contact(c.contact()).await;
        net.set_dead(c.addr(), true);

        let report = a.refresh_contacts(&net).await;
        assert_eq!(report.alive, 1);
        assert_eq!(report.evicted, vec![*c.id()]);
        assert_eq!(a.contacts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_prune_stale_keeps_self() {
        let dir = TempDir::new().unwrap();
        let a = node(&dir, "a", 7001).await;
        a.add_contact(
            Contact::new(NodeId::derive(b"old"), PeerAddr::new("127.0.0.1", 7100)).with_last_seen(0),
        )
        .await;
        a.add_contact(Contact::new(NodeId::derive(b"new"), PeerAddr::new("127.0.0.1", 7101)))
            .await;

        assert_eq!(a.prune_stale(Duration::from_secs(60)).await, 1);
        let contacts = a.contacts().await;
        assert_eq!(contacts.len(), 2);
        assert!(contacts.iter().any(|c| c.id == *a.id()));
    }
}
