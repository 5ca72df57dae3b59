//! Error types for the database core.
//!
//! This module defines all error types using `thiserror` for ergonomic error
//! handling. The taxonomy mirrors the failure classes of the core: handle
//! lookup, pool capacity, physical connection, statement execution and
//! capability probing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    /// An unknown or already-unregistered handle was used. Programmer error.
    #[error("Invalid database handle: {handle}")]
    InvalidHandle { handle: String },

    /// The pool is at capacity and no slot became free within the wait policy.
    #[error("Connection pool exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Driver-level connection failure. Not retried automatically by the pool.
    #[error("Connection failed: {message}")]
    ConnectFailure { message: String },

    /// SQL execution error: syntax, constraint violation, bind mismatch.
    #[error("Statement failed: {message}")]
    StatementFailure {
        message: String,
        /// e.g. "42P01" for undefined table
        sql_state: Option<String>,
    },

    /// A capability could not be determined. Not fatal; callers fall back
    /// to a conservative default.
    #[error("Capability probe inconclusive: {capability}")]
    ProbeInconclusive { capability: String },

    /// Rejected handle or pool configuration.
    #[error("Invalid configuration: {message}")]
    Config { message: String },
}

impl DbError {
    /// Create an invalid-handle error.
    pub fn invalid_handle(handle: impl Into<String>) -> Self {
        Self::InvalidHandle {
            handle: handle.into(),
        }
    }

    /// Create a resource-exhausted error.
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            message: message.into(),
        }
    }

    /// Create a connect-failure error.
    pub fn connect(message: impl Into<String>) -> Self {
        Self::ConnectFailure {
            message: message.into(),
        }
    }

    /// Create a statement-failure error without an SQLSTATE.
    pub fn statement(message: impl Into<String>) -> Self {
        Self::StatementFailure {
            message: message.into(),
            sql_state: None,
        }
    }

    /// Create a statement-failure error with an optional SQLSTATE.
    pub fn statement_with_state(message: impl Into<String>, sql_state: Option<String>) -> Self {
        Self::StatementFailure {
            message: message.into(),
            sql_state,
        }
    }

    /// Create a probe-inconclusive error for a named capability.
    pub fn probe_inconclusive(capability: impl Into<String>) -> Self {
        Self::ProbeInconclusive {
            capability: capability.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// The SQLSTATE code reported by the engine, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::StatementFailure { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectFailure { .. } | Self::ResourceExhausted { .. }
        )
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connect(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::statement_with_state(db_err.message().to_string(), code)
            }
            sqlx::Error::RowNotFound => DbError::statement("no rows returned"),
            sqlx::Error::PoolTimedOut => {
                DbError::resource_exhausted("timed out waiting for a connection")
            }
            sqlx::Error::PoolClosed => DbError::connect("connection pool is closed"),
            sqlx::Error::Io(io_err) => DbError::connect(format!("I/O error: {io_err}")),
            sqlx::Error::Tls(tls_err) => DbError::connect(format!("TLS error: {tls_err}")),
            sqlx::Error::Protocol(msg) => DbError::connect(format!("protocol error: {msg}")),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::statement(format!("type not found: {type_name}"))
            }
            sqlx::Error::ColumnNotFound(col) => {
                DbError::statement(format!("column not found: {col}"))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => {
                DbError::statement(format!("column index {index} out of bounds (len: {len})"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::statement(format!("failed to decode column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => DbError::statement(format!("decode error: {source}")),
            sqlx::Error::WorkerCrashed => DbError::connect("database worker crashed"),
            _ => DbError::statement(format!("database error: {err}")),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
