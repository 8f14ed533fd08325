//! In-memory DHT record map
//!
//! This is a cache, not a consistent datastore: writes are last-writer-wins,
//! nothing is versioned or replicated, and records vanish on restart.

use serde_json::Value;
use std::collections::HashMap;

/// Storage for DHT entries
#[derive(Debug, Default)]
pub struct RecordStore {
    entries: HashMap<String, Value>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the one it replaced
    pub fn store(&mut self, key: String, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
