//! Database-access core for the CMS.
//!
//! This library coordinates concurrent access to a shared, finite resource -
//! database connections - across arbitrary call stacks: a bounded connection
//! pool behind swappable connector variants, a thread-of-control scoped
//! transaction manager with guaranteed release on every exit path, a runtime
//! capability prober that adapts SQL dialect and string-truncation rules to
//! the engine actually connected, and a metadata cache for derived schema
//! facts.

pub mod config;
pub mod db;
pub mod error;

pub use config::{HandleConfig, PoolOptions};
pub use db::{
    Capabilities, CapabilityProber, ConnectSpec, Connector, ContextId, ExecOptions, Handle,
    HandleRegistry, MetadataCache, NamingDirectory, QueryExecutor, SqlParam, TransactionManager,
};
pub use error::{DbError, DbResult};
