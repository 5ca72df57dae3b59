//! Query execution engine.
//!
//! This module provides parameterized query, update and batch-update
//! execution against a handle's current transaction scope:
//! - every call runs inside a scoped acquisition: a scope already open for
//!   the context and handle is joined, otherwise the call opens and owns
//!   its own
//! - results are delivered through a caller-supplied closure over a
//!   [`ResultSet`] cursor with typed column reads
//! - updates report affected rows and, on request, generated keys
//!
//! # Architecture
//!
//! Database-specific code lives in the `mysql`, `postgres` and `sqlite`
//! submodules. Each provides identical functionality adapted to its
//! driver's type system; the code structure is intentionally parallel to
//! make differences obvious.

use crate::db::conn::{DbConn, DbRow, RowIndex};
use crate::db::params::{self, SqlParam};
use crate::db::registry::Handle;
use crate::db::transaction::{ContextId, ScopedConnection, TransactionManager};
use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

/// Per-call execution options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Log statement failures. Disabled by call sites that expect failure
    /// as a normal branch (dialect probing, existence checks).
    pub log_errors: bool,
    /// Use a prepared statement even when there are no parameters.
    pub prepared: bool,
    /// Column names whose generated values should be returned from an
    /// update. Names are uppercased first when the handle folds
    /// identifiers to uppercase.
    pub generated_keys: Option<Vec<String>>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            log_errors: true,
            prepared: true,
            generated_keys: None,
        }
    }
}

impl ExecOptions {
    /// Options with error logging suppressed.
    pub fn quiet() -> Self {
        Self {
            log_errors: false,
            ..Self::default()
        }
    }
}

/// Result of one update execution.
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub rows_affected: u64,
    /// Generated key rows, present when requested and reported.
    pub generated_keys: Vec<serde_json::Map<String, JsonValue>>,
}

/// Cursor over the rows of one result set.
pub struct ResultSet {
    rows: Vec<DbRow>,
    pos: Option<usize>,
}

impl ResultSet {
    fn new(rows: Vec<DbRow>) -> Self {
        Self { rows, pos: None }
    }

    /// Advance to the next row. Returns false past the last row.
    pub fn next(&mut self) -> bool {
        let next = self.pos.map(|p| p + 1).unwrap_or(0);
        if next < self.rows.len() {
            self.pos = Some(next);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names, empty for an empty result set.
    pub fn columns(&self) -> Vec<String> {
        self.rows
            .first()
            .map(DbRow::column_names)
            .unwrap_or_default()
    }

    /// The current row.
    pub fn row(&self) -> DbResult<&DbRow> {
        self.pos
            .and_then(|p| self.rows.get(p))
            .ok_or_else(|| DbError::statement("result set cursor is not positioned on a row"))
    }

    pub fn get_string<I: RowIndex>(&self, index: I) -> DbResult<Option<String>> {
        self.row()?.string(index)
    }

    pub fn get_int<I: RowIndex>(&self, index: I) -> DbResult<Option<i32>> {
        self.row()?.int(index)
    }

    pub fn get_long<I: RowIndex>(&self, index: I) -> DbResult<Option<i64>> {
        self.row()?.long(index)
    }

    pub fn get_double<I: RowIndex>(&self, index: I) -> DbResult<Option<f64>> {
        self.row()?.double(index)
    }

    pub fn get_bool<I: RowIndex>(&self, index: I) -> DbResult<Option<bool>> {
        self.row()?.boolean(index)
    }

    /// Raw value of a column on the current row.
    pub fn get_value(&self, idx: usize) -> DbResult<JsonValue> {
        Ok(self.row()?.value(idx))
    }
}

/// Executes statements against scoped connections.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    transactions: TransactionManager,
}

impl QueryExecutor {
    pub fn new(transactions: TransactionManager) -> Self {
        Self { transactions }
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.transactions
    }

    /// Run a query and hand the result set to `f`.
    pub async fn query<T>(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        sql: &str,
        params: &[SqlParam],
        f: impl FnOnce(&mut ResultSet) -> DbResult<T>,
    ) -> DbResult<T> {
        self.query_opts(ctx, handle, sql, params, &ExecOptions::default(), f)
            .await
    }

    /// Run a query with explicit options.
    pub async fn query_opts<T>(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        sql: &str,
        params: &[SqlParam],
        opts: &ExecOptions,
        f: impl FnOnce(&mut ResultSet) -> DbResult<T>,
    ) -> DbResult<T> {
        let state = self.transactions.registry().lookup(handle)?;
        let capacity = state.config().fetch_size_or_default();
        let scope = self.open_scope(ctx, handle, opts).await?;

        let fetched = {
            let mut guard = scope.connection().await?;
            let pc = guard.conn_mut()?;
            check_param_count(pc.conn_mut(), sql, params);
            match pc.conn_mut() {
                DbConn::MySql(c) => mysql::fetch_rows(c, sql, params, capacity).await,
                DbConn::Postgres(c) => postgres::fetch_rows(c, sql, params, capacity).await,
                DbConn::Sqlite(c) => sqlite::fetch_rows(c, sql, params, capacity).await,
            }
        };

        let outcome = match fetched {
            Ok(rows) => {
                debug!(handle = %handle, rows = rows.len(), "query executed");
                f(&mut ResultSet::new(rows))
            }
            Err(e) => {
                if opts.log_errors {
                    error!(handle = %handle, sql = %sql, error = %e, "query failed");
                }
                Err(e)
            }
        };
        finish_scope(scope, outcome).await
    }

    /// Run an update and return the number of affected rows.
    pub async fn update(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<u64> {
        self.update_opts(ctx, handle, sql, params, &ExecOptions::default())
            .await
            .map(|outcome| outcome.rows_affected)
    }

    /// Run an update with explicit options, returning affected rows and
    /// any requested generated keys.
    pub async fn update_opts(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        sql: &str,
        params: &[SqlParam],
        opts: &ExecOptions,
    ) -> DbResult<UpdateOutcome> {
        let state = self.transactions.registry().lookup(handle)?;
        let keys: Option<Vec<String>> = opts.generated_keys.as_ref().map(|cols| {
            if state.folds_uppercase() {
                cols.iter().map(|c| c.to_uppercase()).collect()
            } else {
                cols.clone()
            }
        });

        let scope = self.open_scope(ctx, handle, opts).await?;
        let executed = {
            let mut guard = scope.connection().await?;
            let pc = guard.conn_mut()?;
            check_param_count(pc.conn_mut(), sql, params);
            match pc.conn_mut() {
                DbConn::MySql(c) => {
                    mysql::execute_update(c, sql, params, opts.prepared, keys.as_deref()).await
                }
                DbConn::Postgres(c) => {
                    postgres::execute_update(c, sql, params, opts.prepared, keys.as_deref()).await
                }
                DbConn::Sqlite(c) => {
                    sqlite::execute_update(c, sql, params, opts.prepared, keys.as_deref()).await
                }
            }
        };

        let outcome = match executed {
            Ok(outcome) => {
                debug!(handle = %handle, rows_affected = outcome.rows_affected, "update executed");
                Ok(outcome)
            }
            Err(e) => {
                if opts.log_errors {
                    error!(handle = %handle, sql = %sql, error = %e, "update failed");
                }
                Err(e)
            }
        };
        finish_scope(scope, outcome).await
    }

    /// Execute one statement for every parameter set, returning the summed
    /// row count. Falls back to sequential updates when the handle reports
    /// no batch-update support.
    pub async fn batch_update(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        sql: &str,
        param_sets: &[Vec<SqlParam>],
    ) -> DbResult<u64> {
        let state = self.transactions.registry().lookup(handle)?;
        if !state.supports_batch() {
            debug!(handle = %handle, "batch updates unsupported, running sequential updates");
            let mut total = 0u64;
            for params in param_sets {
                total += self.update(ctx, handle, sql, params).await?;
            }
            return Ok(total);
        }

        let scope = self.transactions.scoped(ctx, handle).await?;
        let executed = {
            let guard = scope.connection().await;
            match guard {
                Ok(mut guard) => {
                    let run = async {
                        let pc = guard.conn_mut()?;
                        let mut total = 0u64;
                        for params in param_sets {
                            let count = match pc.conn_mut() {
                                DbConn::MySql(c) => mysql::execute_counted(c, sql, params).await?,
                                DbConn::Postgres(c) => {
                                    postgres::execute_counted(c, sql, params).await?
                                }
                                DbConn::Sqlite(c) => {
                                    sqlite::execute_counted(c, sql, params).await?
                                }
                            };
                            // Drivers may report an unknown-count sentinel;
                            // only non-negative counts enter the sum.
                            if count >= 0 {
                                total += count as u64;
                            }
                        }
                        Ok::<u64, DbError>(total)
                    };
                    run.await
                }
                Err(e) => Err(e),
            }
        };

        let outcome = match executed {
            Ok(total) => {
                debug!(handle = %handle, statements = param_sets.len(), rows_affected = total, "batch executed");
                Ok(total)
            }
            Err(e) => {
                error!(handle = %handle, sql = %sql, error = %e, "batch update failed");
                Err(e)
            }
        };
        finish_scope(scope, outcome).await
    }

    async fn open_scope(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        opts: &ExecOptions,
    ) -> DbResult<ScopedConnection> {
        if opts.log_errors {
            self.transactions.scoped(ctx, handle).await
        } else {
            self.transactions.scoped_quiet(ctx, handle).await
        }
    }
}

/// Close `scope` according to `outcome`: success marks the scope before the
/// close, failure lets the close logic roll an owned transaction back.
async fn finish_scope<T>(mut scope: ScopedConnection, outcome: DbResult<T>) -> DbResult<T> {
    if outcome.is_ok() {
        scope.success();
    }
    let closed = scope.close().await;
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

/// Placeholder/parameter count mismatches are logged and the statement is
/// still attempted with the bound placeholders.
fn check_param_count(conn: &DbConn, sql: &str, params: &[SqlParam]) {
    let expected = params::placeholder_count(conn.kind(), sql);
    if expected != params.len() {
        warn!(
            sql = %sql,
            placeholders = expected,
            supplied = params.len(),
            "parameter count mismatch, executing anyway"
        );
    }
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================

mod mysql {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::Executor;
    use sqlx::mysql::MySqlConnection;

    pub async fn fetch_rows(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlParam],
        capacity: usize,
    ) -> DbResult<Vec<DbRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = params::bind_mysql(query, param);
        }
        let mut stream = query.fetch(&mut *conn);
        let mut rows = Vec::with_capacity(capacity);
        while let Some(row) = stream.try_next().await.map_err(DbError::from)? {
            rows.push(DbRow::MySql(row));
        }
        Ok(rows)
    }

    pub async fn execute_update(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlParam],
        prepared: bool,
        keys: Option<&[String]>,
    ) -> DbResult<UpdateOutcome> {
        // Raw execution for statements the engine refuses to prepare.
        let result = if params.is_empty() && !prepared {
            (&mut *conn).execute(sql).await.map_err(DbError::from)?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = params::bind_mysql(query, param);
            }
            query.execute(&mut *conn).await.map_err(DbError::from)?
        };

        let mut outcome = UpdateOutcome {
            rows_affected: result.rows_affected(),
            generated_keys: Vec::new(),
        };
        if let Some(cols) = keys {
            let id = result.last_insert_id();
            if id > 0 {
                let col = cols.first().map(String::as_str).unwrap_or("GENERATED_KEY");
                let mut row = serde_json::Map::new();
                row.insert(col.to_string(), JsonValue::Number(id.into()));
                outcome.generated_keys.push(row);
            }
        }
        Ok(outcome)
    }

    pub async fn execute_counted(
        conn: &mut MySqlConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<i64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = params::bind_mysql(query, param);
        }
        let result = query.execute(&mut *conn).await.map_err(DbError::from)?;
        Ok(result.rows_affected() as i64)
    }
}

mod postgres {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::Executor;
    use sqlx::postgres::PgConnection;

    pub async fn fetch_rows(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlParam],
        capacity: usize,
    ) -> DbResult<Vec<DbRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = params::bind_postgres(query, param);
        }
        let mut stream = query.fetch(&mut *conn);
        let mut rows = Vec::with_capacity(capacity);
        while let Some(row) = stream.try_next().await.map_err(DbError::from)? {
            rows.push(DbRow::Postgres(row));
        }
        Ok(rows)
    }

    pub async fn execute_update(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlParam],
        prepared: bool,
        keys: Option<&[String]>,
    ) -> DbResult<UpdateOutcome> {
        // Generated keys come back through a RETURNING clause.
        if let Some(cols) = keys.filter(|cols| !cols.is_empty()) {
            let sql = format!("{sql} RETURNING {}", cols.join(", "));
            let mut query = sqlx::query(&sql);
            for param in params {
                query = params::bind_postgres(query, param);
            }
            let rows = query.fetch_all(&mut *conn).await.map_err(DbError::from)?;
            return Ok(UpdateOutcome {
                rows_affected: rows.len() as u64,
                generated_keys: rows
                    .into_iter()
                    .map(|r| DbRow::Postgres(r).to_json_map())
                    .collect(),
            });
        }

        let result = if params.is_empty() && !prepared {
            (&mut *conn).execute(sql).await.map_err(DbError::from)?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = params::bind_postgres(query, param);
            }
            query.execute(&mut *conn).await.map_err(DbError::from)?
        };
        Ok(UpdateOutcome {
            rows_affected: result.rows_affected(),
            generated_keys: Vec::new(),
        })
    }

    pub async fn execute_counted(
        conn: &mut PgConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<i64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = params::bind_postgres(query, param);
        }
        let result = query.execute(&mut *conn).await.map_err(DbError::from)?;
        Ok(result.rows_affected() as i64)
    }
}

mod sqlite {
    use super::*;
    use futures_util::TryStreamExt;
    use sqlx::Executor;
    use sqlx::sqlite::SqliteConnection;

    pub async fn fetch_rows(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlParam],
        capacity: usize,
    ) -> DbResult<Vec<DbRow>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = params::bind_sqlite(query, param);
        }
        let mut stream = query.fetch(&mut *conn);
        let mut rows = Vec::with_capacity(capacity);
        while let Some(row) = stream.try_next().await.map_err(DbError::from)? {
            rows.push(DbRow::Sqlite(row));
        }
        Ok(rows)
    }

    pub async fn execute_update(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlParam],
        prepared: bool,
        keys: Option<&[String]>,
    ) -> DbResult<UpdateOutcome> {
        let result = if params.is_empty() && !prepared {
            (&mut *conn).execute(sql).await.map_err(DbError::from)?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = params::bind_sqlite(query, param);
            }
            query.execute(&mut *conn).await.map_err(DbError::from)?
        };

        let mut outcome = UpdateOutcome {
            rows_affected: result.rows_affected(),
            generated_keys: Vec::new(),
        };
        if let Some(cols) = keys {
            let id = result.last_insert_rowid();
            if id > 0 {
                let col = cols.first().map(String::as_str).unwrap_or("GENERATED_KEY");
                let mut row = serde_json::Map::new();
                row.insert(col.to_string(), JsonValue::Number(id.into()));
                outcome.generated_keys.push(row);
            }
        }
        Ok(outcome)
    }

    pub async fn execute_counted(
        conn: &mut SqliteConnection,
        sql: &str,
        params: &[SqlParam],
    ) -> DbResult<i64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = params::bind_sqlite(query, param);
        }
        let result = query.execute(&mut *conn).await.map_err(DbError::from)?;
        Ok(result.rows_affected() as i64)
    }
}
