//! Connector variants: the ways one handle obtains physical connections.
//!
//! Every variant honors the same contract - `acquire`, `release`,
//! `shutdown` - so the layers above never care where a connection came
//! from:
//!
//! - `Pool`: bounded fixed-size pool with slot reuse.
//! - `Direct`: fresh physical connection per acquire, closed on release.
//! - `Naming`: like `Direct`, but the DSN is resolved through a naming
//!   directory at acquire time, so rebinding a name takes effect on the
//!   next acquire.
//! - `DataSource`: draws from an externally owned `sqlx` pool. The external
//!   system owns reuse policy, so release closes the detached connection.

use crate::config::PoolOptions;
use crate::db::conn::{ConnectSpec, DbConn, DbKind};
use crate::db::pool::{FixedPool, PooledConnection};
use crate::error::{DbError, DbResult};
use sqlx::{MySqlPool, PgPool, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Externally owned driver-level pool usable as a data source.
#[derive(Debug, Clone)]
pub enum DbPool {
    MySql(MySqlPool),
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    pub fn kind(&self) -> DbKind {
        match self {
            Self::MySql(_) => DbKind::MySql,
            Self::Postgres(_) => DbKind::Postgres,
            Self::Sqlite(_) => DbKind::Sqlite,
        }
    }

    async fn detach_connection(&self) -> DbResult<DbConn> {
        match self {
            Self::MySql(p) => Ok(DbConn::MySql(p.acquire().await?.detach())),
            Self::Postgres(p) => Ok(DbConn::Postgres(p.acquire().await?.detach())),
            Self::Sqlite(p) => Ok(DbConn::Sqlite(p.acquire().await?.detach())),
        }
    }
}

/// Process-wide directory of named connect specs (managed lookup).
///
/// Injectable rather than a global static so tests can run several
/// independent directories side by side.
#[derive(Debug, Clone, Default)]
pub struct NamingDirectory {
    entries: Arc<RwLock<HashMap<String, ConnectSpec>>>,
}

impl NamingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a name to a connect spec, replacing any previous binding.
    pub fn bind(&self, name: impl Into<String>, spec: ConnectSpec) {
        self.entries.write().unwrap().insert(name.into(), spec);
    }

    /// Remove a binding.
    pub fn unbind(&self, name: &str) -> Option<ConnectSpec> {
        self.entries.write().unwrap().remove(name)
    }

    /// Resolve a name to its bound connect spec.
    pub fn resolve(&self, name: &str) -> DbResult<ConnectSpec> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::connect(format!("no connection bound under name '{name}'")))
    }
}

/// Strategy for producing and destroying physical connections for one
/// handle.
#[derive(Debug)]
pub enum Connector {
    /// Bounded fixed-size pool.
    Pool(FixedPool),
    /// Fresh connection per acquire; physical close on release.
    Direct { spec: ConnectSpec },
    /// DSN resolved through a naming directory at acquire time.
    Naming {
        name: String,
        directory: NamingDirectory,
    },
    /// Delegates to an externally pooled data source.
    DataSource { pool: DbPool },
}

impl Connector {
    /// Pooled connector for `spec`, sized by `options`.
    pub fn pooled(spec: ConnectSpec, options: &PoolOptions) -> Self {
        Self::Pool(FixedPool::new(spec, options))
    }

    /// Non-pooled one-shot connector.
    pub fn direct(spec: ConnectSpec) -> Self {
        Self::Direct { spec }
    }

    /// Managed-lookup connector resolving `name` in `directory`.
    pub fn naming(name: impl Into<String>, directory: NamingDirectory) -> Self {
        Self::Naming {
            name: name.into(),
            directory,
        }
    }

    /// Connector delegating to an external data source.
    pub fn data_source(pool: DbPool) -> Self {
        Self::DataSource { pool }
    }

    /// Driver family this connector produces connections for.
    pub fn kind(&self) -> DbResult<DbKind> {
        match self {
            Self::Pool(pool) => Ok(pool.kind()),
            Self::Direct { spec } => Ok(spec.kind),
            Self::Naming { name, directory } => Ok(directory.resolve(name)?.kind),
            Self::DataSource { pool } => Ok(pool.kind()),
        }
    }

    /// Obtain a connection.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        match self {
            Self::Pool(pool) => pool.acquire().await,
            Self::Direct { spec } => Ok(PooledConnection::untracked(DbConn::connect(spec).await?)),
            Self::Naming { name, directory } => {
                let spec = directory.resolve(name)?;
                Ok(PooledConnection::untracked(DbConn::connect(&spec).await?))
            }
            Self::DataSource { pool } => {
                Ok(PooledConnection::untracked(pool.detach_connection().await?))
            }
        }
    }

    /// Give a connection back. Pooled slots return to the free list; all
    /// other variants close physically.
    pub async fn release(&self, pc: PooledConnection) {
        match self {
            Self::Pool(pool) => pool.release(pc).await,
            Self::Direct { .. } | Self::Naming { .. } | Self::DataSource { .. } => pc.close().await,
        }
    }

    /// Dispose of a connection whose state is no longer trustworthy. The
    /// pooled variant keeps the slot but forces a reconnect for its next
    /// borrower.
    pub async fn discard(&self, pc: PooledConnection) {
        match self {
            Self::Pool(pool) => pool.discard(pc).await,
            Self::Direct { .. } | Self::Naming { .. } | Self::DataSource { .. } => pc.close().await,
        }
    }

    /// Shut the connector down. Pool slots are closed; the data-source
    /// variant leaves the externally owned pool untouched.
    pub async fn shutdown(&self) {
        match self {
            Self::Pool(pool) => pool.shutdown().await,
            Self::Direct { .. } | Self::Naming { .. } => {}
            Self::DataSource { pool } => {
                debug!(kind = %pool.kind(), "data-source connector closed; external pool left running");
            }
        }
    }
}
