//! Metadata cache: region -> key -> value.
//!
//! Memoizes derived, expensive-to-compute facts (table existence, column
//! lists) keyed by a named region. Invalidation is deliberately coarse: a
//! schema-mutating operation clears the whole region rather than chasing
//! the affected keys. Keys that belong to a handle carry a
//! `"<handle id>:"` prefix so unregistering a handle can purge them
//! wholesale.

use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Well-known cache regions.
pub mod regions {
    /// Column name/type lists per table.
    pub const TABLE_COLUMNS: &str = "table_columns";
    /// Table existence flags.
    pub const TABLES: &str = "tables";
    /// Field existence flags.
    pub const FIELDS: &str = "fields";
}

/// Two-level cache of derived database facts.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    inner: Arc<Mutex<HashMap<String, HashMap<String, JsonValue>>>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the cache key for a handle-scoped fact.
    pub fn handle_key(handle_id: &str, parts: &[&str]) -> String {
        let mut key = String::from(handle_id);
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Look a value up. `None` is a miss.
    pub fn get(&self, region: &str, key: &str) -> Option<JsonValue> {
        self.inner
            .lock()
            .unwrap()
            .get(region)
            .and_then(|entries| entries.get(key).cloned())
    }

    /// Store a value.
    pub fn put(&self, region: &str, key: impl Into<String>, value: JsonValue) {
        self.inner
            .lock()
            .unwrap()
            .entry(region.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    /// Remove one key.
    pub fn remove(&self, region: &str, key: &str) -> Option<JsonValue> {
        self.inner
            .lock()
            .unwrap()
            .get_mut(region)
            .and_then(|entries| entries.remove(key))
    }

    /// Drop every entry in a region.
    pub fn invalidate_region(&self, region: &str) {
        if let Some(entries) = self.inner.lock().unwrap().remove(region) {
            debug!(region, dropped = entries.len(), "cache region invalidated");
        }
    }

    /// Drop every entry, in every region, that belongs to a handle.
    pub fn purge_handle(&self, handle_id: &str) {
        let prefix = format!("{handle_id}:");
        let mut cache = self.inner.lock().unwrap();
        let mut dropped = 0usize;
        for entries in cache.values_mut() {
            let before = entries.len();
            entries.retain(|key, _| !key.starts_with(&prefix));
            dropped += before - entries.len();
        }
        if dropped > 0 {
            debug!(handle = handle_id, dropped, "handle cache entries purged");
        }
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    /// Number of entries in a region.
    pub fn region_len(&self, region: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .get(region)
            .map(HashMap::len)
            .unwrap_or(0)
    }
}
