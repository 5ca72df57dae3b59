//! Handle registry: the process-wide table of database handles.
//!
//! A handle is an opaque, cheaply cloneable identifier for one configured
//! database target. The registry maps it to its connector, configuration,
//! probed capabilities and per-handle existence cache. It is an injectable
//! object owned by the application's startup/shutdown lifecycle, not a
//! language-level static, so tests can run several registries side by side.

use crate::config::HandleConfig;
use crate::db::cache::MetadataCache;
use crate::db::connector::Connector;
use crate::db::probe::Capabilities;
use crate::db::truncate::LengthSemantics;
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::info;

/// Opaque identifier for one registered database target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Handle {
    id: Arc<str>,
}

impl Handle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Everything the registry knows about one handle.
#[derive(Debug)]
pub struct HandleState {
    config: HandleConfig,
    connector: Connector,
    /// Probed capabilities. Single-flight; stays empty after a failed probe
    /// so a later call can retry.
    pub(crate) capabilities: OnceCell<Capabilities>,
    /// Table/field existence flags, active only with `cache_metadata`.
    existence: Mutex<HashMap<String, bool>>,
}

impl HandleState {
    pub fn config(&self) -> &HandleConfig {
        &self.config
    }

    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// Probed capabilities, if the probe has completed.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.get()
    }

    /// Whether identifiers are folded to uppercase for this handle.
    /// Configuration overrides the probed value.
    pub fn folds_uppercase(&self) -> bool {
        self.config.uppercase_identifiers.unwrap_or_else(|| {
            self.capabilities()
                .map(|c| c.folds_uppercase)
                .unwrap_or(false)
        })
    }

    /// Whether batched updates may be used for this handle.
    /// Configuration overrides the probed value.
    pub fn supports_batch(&self) -> bool {
        self.config.supports_batch.unwrap_or_else(|| {
            self.capabilities()
                .map(|c| c.supports_batch)
                .unwrap_or(true)
        })
    }

    /// String-length semantics; conservative byte counting until probed.
    pub fn length_semantics(&self) -> LengthSemantics {
        self.capabilities()
            .map(|c| c.length_semantics)
            .unwrap_or_default()
    }

    fn existence_key(table: &str, field: Option<&str>) -> String {
        match field {
            Some(field) => format!("{table}:{field}"),
            None => table.to_string(),
        }
    }

    /// Cached table/field existence, if caching is enabled and recorded.
    pub fn cached_existence(&self, table: &str, field: Option<&str>) -> Option<bool> {
        if !self.config.cache_metadata {
            return None;
        }
        self.existence
            .lock()
            .unwrap()
            .get(&Self::existence_key(table, field))
            .copied()
    }

    /// Record a table/field existence fact. No-op unless caching is enabled.
    pub fn record_existence(&self, table: &str, field: Option<&str>, exists: bool) {
        if !self.config.cache_metadata {
            return;
        }
        self.existence
            .lock()
            .unwrap()
            .insert(Self::existence_key(table, field), exists);
    }

    /// Drop every cached existence fact (schema changed).
    pub fn clear_existence(&self) {
        self.existence.lock().unwrap().clear();
    }
}

/// Process-wide mapping of handle id to handle state.
#[derive(Debug, Clone)]
pub struct HandleRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
struct RegistryInner {
    handles: RwLock<HashMap<String, Arc<HandleState>>>,
    cache: MetadataCache,
}

impl HandleRegistry {
    /// Create a registry that purges `cache` entries on unregister.
    pub fn new(cache: MetadataCache) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                handles: RwLock::new(HashMap::new()),
                cache,
            }),
        }
    }

    /// Register a new handle backed by `connector`.
    pub fn register(&self, config: HandleConfig, connector: Connector) -> DbResult<Handle> {
        config.validate()?;
        let id = config.id.clone();

        let mut handles = self.inner.handles.write().unwrap();
        if handles.contains_key(&id) {
            return Err(DbError::config(format!(
                "handle '{id}' is already registered"
            )));
        }
        let state = Arc::new(HandleState {
            config,
            connector,
            capabilities: OnceCell::new(),
            existence: Mutex::new(HashMap::new()),
        });
        handles.insert(id.clone(), state);
        info!(handle = %id, "database handle registered");
        Ok(Handle { id: Arc::from(id) })
    }

    /// Unregister a handle: shut its connector down, purge its cached
    /// metadata and drop it from the mapping.
    pub async fn unregister(&self, handle: &Handle) -> DbResult<()> {
        let state = {
            let mut handles = self.inner.handles.write().unwrap();
            handles
                .remove(handle.id())
                .ok_or_else(|| DbError::invalid_handle(handle.id()))?
        };
        state.connector.shutdown().await;
        state.clear_existence();
        self.inner.cache.purge_handle(handle.id());
        info!(handle = %handle, "database handle unregistered");
        Ok(())
    }

    /// Resolve a handle to its state.
    pub fn lookup(&self, handle: &Handle) -> DbResult<Arc<HandleState>> {
        self.lookup_id(handle.id())
    }

    pub(crate) fn lookup_id(&self, id: &str) -> DbResult<Arc<HandleState>> {
        self.inner
            .handles
            .read()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::invalid_handle(id))
    }

    pub fn contains(&self, handle: &Handle) -> bool {
        self.inner
            .handles
            .read()
            .unwrap()
            .contains_key(handle.id())
    }

    /// Ids of every registered handle.
    pub fn list(&self) -> Vec<String> {
        self.inner.handles.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.handles.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The metadata cache shared with this registry.
    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.inner.cache
    }

    /// Unregister every handle (application shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<(String, Arc<HandleState>)> = {
            let mut handles = self.inner.handles.write().unwrap();
            handles.drain().collect()
        };
        for (id, state) in drained {
            state.connector.shutdown().await;
            state.clear_existence();
            self.inner.cache.purge_handle(&id);
        }
        info!("all database handles closed");
    }
}
