//! Distance-ordered routing table

use crate::id::{distance, NodeId};
use crate::now_millis;
use chunkdht_core::PeerAddr;
use serde::{Deserialize, Serialize};

/// A remote peer known to a node
///
/// On the wire a contact is `{id, host, port}`; `last_seen` is local bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    #[serde(flatten)]
    pub addr: PeerAddr,
    /// Milliseconds since the Unix epoch when this contact was last heard from
    #[serde(skip)]
    pub last_seen: u64,
}

impl Contact {
    pub fn new(id: NodeId, addr: PeerAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: now_millis(),
        }
    }

    pub fn with_last_seen(mut self, last_seen: u64) -> Self {
        self.last_seen = last_seen;
        self
    }
}

/// Contacts are the same peer when their ids match
impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

/// A seed entry used to join the network; `id` may be unknown
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<NodeId>,
}

impl BootstrapPeer {
    pub fn addr(&self) -> PeerAddr {
        PeerAddr::new(self.host.clone(), self.port)
    }
}

impl From<PeerAddr> for BootstrapPeer {
    fn from(addr: PeerAddr) -> Self {
        Self {
            host: addr.host,
            port: addr.port,
            id: None,
        }
    }
}

impl From<&Contact> for BootstrapPeer {
    fn from(contact: &Contact) -> Self {
        Self {
            host: contact.addr.host.clone(),
            port: contact.addr.port,
            id: Some(contact.id),
        }
    }
}

/// Contacts of one node, kept sorted by XOR distance to the owner's id and
/// truncated to a fixed capacity.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our node ID
    local_id: NodeId,
    /// Maximum number of contacts retained
    capacity: usize,
    /// Ascending by distance to `local_id`, unique by id
    contacts: Vec<Contact>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, capacity: usize) -> Self {
        Self {
            local_id,
            capacity: capacity.max(1),
            contacts: Vec::new(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add or refresh a contact.
    ///
    /// An existing entry with the same id is replaced. Returns false when the
    /// contact fell off the end of the table.
    pub fn add(&mut self, contact: Contact) -> bool {
        let id = contact.id;
        self.contacts.retain(|c| c.id != id);
        self.contacts.push(contact);

        let local_id = self.local_id;
        self.contacts.sort_by_key(|c| distance(&c.id, &local_id));
        self.contacts.truncate(self.capacity);

        self.contains(&id)
    }

    /// Up to `count` contacts, ascending by distance to `target`
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<Contact> {
        let mut nodes = self.contacts.clone();
        nodes.sort_by_key(|c| distance(&c.id, target));
        nodes.truncate(count);
        nodes
    }

    /// Snapshot of every contact, in table order
    pub fn all(&self) -> Vec<Contact> {
        self.contacts.clone()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == *id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let pos = self.contacts.iter().position(|c| c.id == *id)?;
        Some(self.contacts.remove(pos))
    }

    /// Drop contacts last seen before `cutoff` (ms since epoch).
    /// The owner's own entry is never pruned.
    pub fn prune_older_than(&mut self, cutoff: u64) -> Vec<Contact> {
        let local_id = self.local_id;
        let (stale, keep): (Vec<Contact>, Vec<Contact>) = self
            .contacts
            .drain(..)
            .partition(|c| c.id != local_id && c.last_seen < cutoff);
        self.contacts = keep;
        stale
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}
