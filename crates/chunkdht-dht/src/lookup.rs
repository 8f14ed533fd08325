//! Iterative lookup protocol
//!
//! The lookups here are a breadth-first crawl in batches of `alpha`
//! parallel RPCs: every contact that answers hands back more contacts, unseen
//! ones join the shortlist, and the crawl ends when a value turns up or the
//! shortlist runs dry. There is no convergence check against the globally
//! closest set.
//!
//! Failed RPCs are dropped silently; a lookup never fails, it only comes back
//! empty.

use crate::id::{distance, NodeId};
use crate::routing::{BootstrapPeer, Contact};
use crate::rpc::{FindValueOutcome, PeerRpc};
use crate::short_key;
use chunkdht_core::PeerAddr;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Everything a lookup observed on its way
#[derive(Debug, Clone, Default)]
pub struct LookupTrace<T> {
    /// What the lookup was after: a value, or the closest contacts
    pub result: T,
    /// Contacts that answered, in answer order
    pub responded: Vec<Contact>,
    /// Contacts learned from replies that were not in the start set
    pub learned: Vec<Contact>,
    /// Number of RPCs issued
    pub queried: usize,
}

/// Shortlist plus the ids already scheduled for a query
struct Crawl {
    shortlist: VecDeque<Contact>,
    seen: HashSet<NodeId>,
}

impl Crawl {
    fn new(start: &[Contact]) -> Self {
        let mut crawl = Self {
            shortlist: VecDeque::with_capacity(start.len()),
            seen: HashSet::new(),
        };
        for contact in start {
            if crawl.seen.insert(contact.id) {
                crawl.shortlist.push_back(contact.clone());
            }
        }
        crawl
    }

    fn next_batch(&mut self, alpha: usize) -> Vec<Contact> {
        let n = alpha.max(1).min(self.shortlist.len());
        self.shortlist.drain(..n).collect()
    }

    /// Queue unseen contacts; returns the ones that were new
    fn merge(&mut self, contacts: Vec<Contact>) -> Vec<Contact> {
        let mut fresh = Vec::new();
        for contact in contacts {
            if self.seen.insert(contact.id) {
                self.shortlist.push_back(contact.clone());
                fresh.push(contact);
            }
        }
        fresh
    }
}

/// Search the network for the value stored under `key`.
///
/// Returns `None` when the crawl exhausts every reachable contact.
pub async fn find_value<R: PeerRpc + ?Sized>(
    rpc: &R,
    start: &[Contact],
    key: &str,
    alpha: usize,
) -> Option<Value> {
    find_value_traced(rpc, start, key, alpha).await.result
}

/// [`find_value`], also reporting which contacts answered and were learned.
///
/// The first reply carrying a value wins; RPCs of the same batch still in
/// flight are dropped at that point.
pub async fn find_value_traced<R: PeerRpc + ?Sized>(
    rpc: &R,
    start: &[Contact],
    key: &str,
    alpha: usize,
) -> LookupTrace<Option<Value>> {
    let mut crawl = Crawl::new(start);
    let mut trace = LookupTrace::default();

    while !crawl.shortlist.is_empty() {
        let batch = crawl.next_batch(alpha);
        trace.queried += batch.len();

        let mut pending: FuturesUnordered<_> = batch
            .into_iter()
            .map(|contact| async move {
                let result = rpc.find_value(&contact.addr, key).await;
                (contact, result)
            })
            .collect();

        while let Some((contact, result)) = pending.next().await {
            match result {
                Ok(FindValueOutcome::Value(value)) => {
                    debug!("find_value {}: value from {}", short_key(key), contact.addr);
                    trace.responded.push(contact);
                    trace.result = Some(value);
                    return trace;
                }
                Ok(FindValueOutcome::Contacts(contacts)) => {
                    trace.responded.push(contact);
                    let fresh = crawl.merge(contacts);
                    trace.learned.extend(fresh);
                }
                Err(e) => {
                    debug!("find_value {}: no answer from {}: {}", short_key(key), contact.addr, e);
                }
            }
        }
    }

    debug!(
        "find_value {}: not found after {} queries",
        short_key(key),
        trace.queried
    );
    trace
}

/// Crawl for the contacts closest to `target`.
///
/// Returns up to `count` contacts that answered, ascending by distance.
pub async fn find_node<R: PeerRpc + ?Sized>(
    rpc: &R,
    start: &[Contact],
    target: &NodeId,
    alpha: usize,
    count: usize,
) -> Vec<Contact> {
    find_node_traced(rpc, start, target, alpha, count).await.result
}

/// [`find_node`], also reporting which contacts answered and were learned
pub async fn find_node_traced<R: PeerRpc + ?Sized>(
    rpc: &R,
    start: &[Contact],
    target: &NodeId,
    alpha: usize,
    count: usize,
) -> LookupTrace<Vec<Contact>> {
    let mut crawl = Crawl::new(start);
    let mut trace: LookupTrace<Vec<Contact>> = LookupTrace::default();

    while !crawl.shortlist.is_empty() {
        let batch = crawl.next_batch(alpha);
        trace.queried += batch.len();

        let replies = join_all(batch.into_iter().map(|contact| async move {
            let result = rpc.find_node(&contact.addr, target).await;
            (contact, result)
        }))
        .await;

        for (contact, result) in replies {
            match result {
                Ok(contacts) => {
                    trace.responded.push(contact);
                    let fresh = crawl.merge(contacts);
                    trace.learned.extend(fresh);
                }
                Err(e) => debug!("find_node: no answer from {}: {}", contact.addr, e),
            }
        }
    }

    let mut closest = trace.responded.clone();
    closest.sort_by_key(|c| distance(&c.id, target));
    closest.truncate(count);
    trace.result = closest;
    trace
}

/// Push `key -> value` to the first `alpha` of `contacts`, in parallel.
///
/// Best effort: individual failures are ignored. Returns how many stores
/// were acknowledged.
pub async fn store_value<R: PeerRpc + ?Sized>(
    rpc: &R,
    contacts: &[Contact],
    key: &str,
    value: &Value,
    alpha: usize,
) -> usize {
    let results = join_all(
        contacts
            .iter()
            .take(alpha)
            .map(|contact| async move { (contact, rpc.store(&contact.addr, key, value).await) }),
    )
    .await;

    let mut acked = 0;
    for (contact, result) in results {
        match result {
            Ok(()) => acked += 1,
            Err(e) => debug!("store {}: {} did not ack: {}", short_key(key), contact.addr, e),
        }
    }
    acked
}

/// Find the contacts closest to `key`, then store the value on them.
///
/// Falls back to `start` (sorted by distance to the key) when the crawl
/// reaches nobody.
pub async fn announce_value<R: PeerRpc + ?Sized>(
    rpc: &R,
    start: &[Contact],
    key: &str,
    value: &Value,
    alpha: usize,
    k: usize,
) -> usize {
    let target = NodeId::for_key(key);
    let mut closest = find_node(rpc, start, &target, alpha, k).await;
    if closest.is_empty() {
        closest = start.to_vec();
        closest.sort_by_key(|c| distance(&c.id, &target));
    }
    store_value(rpc, &closest, key, value, alpha).await
}

/// Turn seed entries into contacts.
///
/// Entries matching `local` are skipped. Entries without an id are pinged to
/// learn it; those that do not answer are dropped.
pub async fn resolve_bootstrap<R: PeerRpc + ?Sized>(
    rpc: &R,
    peers: &[BootstrapPeer],
    local: Option<&PeerAddr>,
) -> Vec<Contact> {
    let candidates = peers.iter().filter(|peer| {
        let is_self = local.is_some_and(|addr| addr.host == peer.host && addr.port == peer.port);
        if is_self {
            debug!("Skipping bootstrap entry {}:{} (self)", peer.host, peer.port);
        }
        !is_self
    });

    let resolved = join_all(candidates.map(|peer| async move {
        let addr = peer.addr();
        match peer.id {
            Some(id) => Some(Contact::new(id, addr)),
            None => match rpc.ping(&addr).await {
                Ok(id) => Some(Contact::new(id, addr)),
                Err(e) => {
                    tracing::warn!("Bootstrap peer {} did not answer ping: {}", addr, e);
                    None
                }
            },
        }
    }))
    .await;

    resolved.into_iter().flatten().collect()
}
