//! Database abstraction layer.
//!
//! This module provides the database-access core:
//! - Handle registry and connector variants
//! - Bounded connection pooling
//! - Thread-of-control scoped transaction management
//! - Query execution with typed parameter binding
//! - Runtime dialect capability probing
//! - Metadata caching

pub mod cache;
pub mod conn;
pub mod connector;
pub mod executor;
pub mod params;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod transaction;
pub mod truncate;

pub use cache::MetadataCache;
pub use conn::{ConnectSpec, DbConn, DbKind, DbProduct, DbRow};
pub use connector::{Connector, DbPool, NamingDirectory};
pub use executor::{ExecOptions, QueryExecutor, ResultSet, UpdateOutcome};
pub use params::{SqlParam, SqlType};
pub use pool::{FixedPool, PooledConnection};
pub use probe::{Capabilities, CapabilityProber, ConcatStyle, LimitStyle, TextCast};
pub use registry::{Handle, HandleRegistry, HandleState};
pub use transaction::{ContextId, ScopedConnection, TransactionManager};
pub use truncate::LengthSemantics;
