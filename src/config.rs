//! Configuration handling for the database core.
//!
//! This module defines the per-handle configuration surface consumed from
//! external configuration loading: pool sizing and wait policy, schema name,
//! fetch size, dialect overrides and metadata-caching flags.

use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_TEST_BEFORE_ACQUIRE: bool = true;

// Handle configuration defaults
pub const DEFAULT_FETCH_SIZE: usize = 128;

/// Connection pool configuration options for one handle.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolOptions {
    /// Maximum connections in the pool (default: 10)
    pub max_connections: Option<u32>,
    /// Acquire wait bound in seconds. `None` waits indefinitely for a free
    /// slot; on expiry the acquire fails with `ResourceExhausted`.
    pub acquire_timeout_secs: Option<u64>,
    /// Whether to liveness-check pooled connections before handing them out
    /// (default: true)
    pub test_before_acquire: Option<bool>,
}

impl PoolOptions {
    /// Get max_connections with default value.
    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Get the acquire wait bound, if one is configured.
    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_secs.map(Duration::from_secs)
    }

    /// Get test_before_acquire with default value.
    pub fn test_before_acquire_or_default(&self) -> bool {
        self.test_before_acquire
            .unwrap_or(DEFAULT_TEST_BEFORE_ACQUIRE)
    }

    /// Validate pool options.
    pub fn validate(&self) -> DbResult<()> {
        if let Some(max) = self.max_connections {
            if max == 0 {
                return Err(DbError::config("max_connections must be greater than 0"));
            }
        }
        if let Some(secs) = self.acquire_timeout_secs {
            if secs == 0 {
                return Err(DbError::config(
                    "acquire_timeout_secs must be greater than 0; omit it to wait indefinitely",
                ));
            }
        }
        Ok(())
    }
}

/// Configuration for one database handle.
///
/// A handle describes one logical database target. The dialect fields
/// (`uppercase_identifiers`, `supports_batch`) are overrides; when left
/// unset the capability prober's detected values apply.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HandleConfig {
    /// Handle identifier. Used in cache keys and log output.
    pub id: String,
    /// Human-readable display name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Database schema to qualify unqualified object names with.
    #[serde(default)]
    pub schema: Option<String>,
    /// Row buffer sizing hint for query results.
    #[serde(default)]
    pub fetch_size: Option<usize>,
    /// Force identifier uppercasing on or off instead of the probed value.
    #[serde(default)]
    pub uppercase_identifiers: Option<bool>,
    /// Force batched-update support on or off instead of the probed value.
    #[serde(default)]
    pub supports_batch: Option<bool>,
    /// Enable the per-handle table/field existence cache.
    #[serde(default)]
    pub cache_metadata: bool,
    /// Leave the driver in autocommit mode: scopes never issue BEGIN and
    /// never commit or roll back on close.
    #[serde(default)]
    pub autocommit: bool,
    /// Logical table name -> physical table name overrides.
    #[serde(default)]
    pub table_overrides: HashMap<String, String>,
    /// Connection pool configuration options.
    #[serde(default)]
    pub pool: PoolOptions,
}

impl HandleConfig {
    /// Create a configuration with defaults for everything but the id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: None,
            schema: None,
            fetch_size: None,
            uppercase_identifiers: None,
            supports_batch: None,
            cache_metadata: false,
            autocommit: false,
            table_overrides: HashMap::new(),
            pool: PoolOptions::default(),
        }
    }

    /// Get fetch_size with default value.
    pub fn fetch_size_or_default(&self) -> usize {
        self.fetch_size.unwrap_or(DEFAULT_FETCH_SIZE)
    }

    /// Resolve a logical table name through the configured overrides.
    pub fn resolve_table<'a>(&'a self, table: &'a str) -> &'a str {
        self.table_overrides
            .get(table)
            .map(String::as_str)
            .unwrap_or(table)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> DbResult<()> {
        if self.id.is_empty() {
            return Err(DbError::config("handle id cannot be empty"));
        }
        if !self
            .id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DbError::config(format!(
                "handle id contains invalid characters: {}",
                self.id
            )));
        }
        if let Some(0) = self.fetch_size {
            return Err(DbError::config("fetch_size must be greater than 0"));
        }
        self.pool.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_options_defaults() {
        let opts = PoolOptions::default();
        assert_eq!(opts.max_connections_or_default(), DEFAULT_MAX_CONNECTIONS);
        assert_eq!(opts.acquire_timeout(), None);
        assert!(opts.test_before_acquire_or_default());
    }

    #[test]
    fn test_pool_options_validate() {
        let opts = PoolOptions {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = PoolOptions {
            acquire_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(opts.validate().is_err());

        let opts = PoolOptions {
            max_connections: Some(4),
            acquire_timeout_secs: Some(30),
            test_before_acquire: Some(false),
        };
        assert!(opts.validate().is_ok());
        assert_eq!(opts.acquire_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_handle_config_validate_id() {
        assert!(HandleConfig::new("online").validate().is_ok());
        assert!(HandleConfig::new("my-handle_2").validate().is_ok());
        assert!(HandleConfig::new("").validate().is_err());
        assert!(HandleConfig::new("bad id").validate().is_err());
    }

    #[test]
    fn test_handle_config_table_overrides() {
        let mut config = HandleConfig::new("online");
        config
            .table_overrides
            .insert("resources".to_string(), "cms_resources".to_string());
        assert_eq!(config.resolve_table("resources"), "cms_resources");
        assert_eq!(config.resolve_table("projects"), "projects");
    }

    #[test]
    fn test_handle_config_fetch_size() {
        let mut config = HandleConfig::new("online");
        assert_eq!(config.fetch_size_or_default(), DEFAULT_FETCH_SIZE);
        config.fetch_size = Some(0);
        assert!(config.validate().is_err());
        config.fetch_size = Some(512);
        assert_eq!(config.fetch_size_or_default(), 512);
    }

    #[test]
    fn test_handle_config_deserialize_defaults() {
        let config: HandleConfig = serde_json::from_str(r#"{"id":"online"}"#).unwrap();
        assert!(!config.cache_metadata);
        assert!(!config.autocommit);
        assert!(config.table_overrides.is_empty());
        assert!(config.pool.max_connections.is_none());
    }
}
