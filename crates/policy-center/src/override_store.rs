use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;

/// Runtime overrides keyed by dotted path, each with an optional expiry.
#[derive(Clone, Debug, Default)]
pub struct OverrideStore {
    entries: BTreeMap<String, OverrideEntry>,
}

#[derive(Clone, Debug)]
struct OverrideEntry {
    value: Value,
    expires_at: Option<Instant>,
}

impl OverrideStore {
    pub fn insert(&mut self, path: String, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|dur| Instant::now() + dur);
        self.entries.insert(path, OverrideEntry { value, expires_at });
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries and returns the live ones in path order.
    pub fn active_entries(&mut self) -> Vec<(String, Value)> {
        let now = Instant::now();
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        self.entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.value.clone()))
            .collect()
    }
}
