//! Transaction manager: at most one open scope per context per handle.
//!
//! A *scope* associates a thread-of-control (represented by an explicit
//! [`ContextId`] token rather than implicit thread-local storage) and a
//! handle with one borrowed connection. The idiomatic entry point is
//! [`TransactionManager::scoped`]: the first opener owns the scope and its
//! terminal outcome; nested calls for the same context and handle
//! participate in the open scope without owning it. Every exit path -
//! normal close, early return, drop during unwinding - releases the
//! connection exactly once.
//!
//! Scopes also carry deferred file removals: paths queued on the borrowed
//! connection are deleted only when the matching outcome (commit or
//! rollback) occurs.

use crate::db::pool::PooledConnection;
use crate::db::registry::{Handle, HandleRegistry};
use crate::error::{DbError, DbResult};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

/// Identity token for one logical thread of control.
///
/// Callers create one per unit of work (request, job, worker turn) and pass
/// it through the call stack; two contexts never see each other's scopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextId(uuid::Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

type ScopeKey = (ContextId, String);

#[derive(Debug)]
pub(crate) struct ScopeState {
    conn: Option<PooledConnection>,
    /// Whether this scope issued BEGIN (as opposed to reusing a connection
    /// whose transaction was already running, or autocommit mode).
    began: bool,
}

/// Thread-of-control scoped transaction tracking.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    inner: Arc<TxInner>,
}

#[derive(Debug)]
struct TxInner {
    registry: HandleRegistry,
    scopes: RwLock<HashMap<ScopeKey, Arc<Mutex<ScopeState>>>>,
}

impl TransactionManager {
    pub fn new(registry: HandleRegistry) -> Self {
        Self {
            inner: Arc::new(TxInner {
                registry,
                scopes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.inner.registry
    }

    fn key(ctx: &ContextId, handle_id: &str) -> ScopeKey {
        (ctx.clone(), handle_id.to_string())
    }

    fn entry(&self, key: &ScopeKey) -> Option<Arc<Mutex<ScopeState>>> {
        self.inner.scopes.read().unwrap().get(key).cloned()
    }

    /// Whether a scope is open for this context and handle.
    pub fn has_scope(&self, ctx: &ContextId, handle: &Handle) -> bool {
        self.entry(&Self::key(ctx, handle.id())).is_some()
    }

    /// Number of open scopes across all contexts.
    pub fn open_scopes(&self) -> usize {
        self.inner.scopes.read().unwrap().len()
    }

    /// Open or join a scope for one statement or one logical unit of work.
    ///
    /// If a scope is already open for this context and handle it is joined
    /// (the returned guard does not own closing it). Otherwise a connection
    /// is borrowed, BEGIN issued unless the handle is in autocommit mode,
    /// and the returned guard owns the terminal outcome.
    pub async fn scoped(&self, ctx: &ContextId, handle: &Handle) -> DbResult<ScopedConnection> {
        self.scoped_opts(ctx, handle, true).await
    }

    /// Like [`scoped`](Self::scoped) with error logging suppressed, for
    /// call sites that expect failure as a normal branch (dialect probing,
    /// existence checks).
    pub async fn scoped_quiet(
        &self,
        ctx: &ContextId,
        handle: &Handle,
    ) -> DbResult<ScopedConnection> {
        self.scoped_opts(ctx, handle, false).await
    }

    async fn scoped_opts(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        log_errors: bool,
    ) -> DbResult<ScopedConnection> {
        let key = Self::key(ctx, handle.id());
        if self.entry(&key).is_some() {
            return Ok(self.guard(ctx, handle, false, log_errors));
        }

        let state = self.inner.registry.lookup(handle)?;
        let mut pc = state.connector().acquire().await?;
        let mut began = false;
        if !state.config().autocommit && !pc.tx_running() {
            if let Err(e) = pc.conn_mut().begin().await {
                if log_errors {
                    error!(handle = %handle, error = %e, "failed to start transaction");
                }
                state.connector().discard(pc).await;
                return Err(e);
            }
            pc.set_tx_running(true);
            began = true;
        }

        let scope = ScopeState {
            conn: Some(pc),
            began,
        };
        match self.insert_scope(key, scope) {
            Ok(()) => Ok(self.guard(ctx, handle, true, log_errors)),
            Err(mut lost) => {
                // A scope for this context appeared concurrently; join it
                // and give our connection back.
                if let Some(mut pc) = lost.conn.take() {
                    if lost.began {
                        let _ = pc.conn_mut().rollback().await;
                        pc.set_tx_running(false);
                    }
                    state.connector().release(pc).await;
                }
                Ok(self.guard(ctx, handle, false, log_errors))
            }
        }
    }

    fn guard(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        owns: bool,
        log_errors: bool,
    ) -> ScopedConnection {
        ScopedConnection {
            mgr: self.clone(),
            ctx: ctx.clone(),
            handle: handle.clone(),
            owns,
            success: false,
            log_errors,
            closed: false,
        }
    }

    fn insert_scope(&self, key: ScopeKey, scope: ScopeState) -> Result<(), ScopeState> {
        let mut scopes = self.inner.scopes.write().unwrap();
        if scopes.contains_key(&key) {
            return Err(scope);
        }
        scopes.insert(key, Arc::new(Mutex::new(scope)));
        Ok(())
    }

    /// Explicitly start a transaction scope.
    ///
    /// An already-open scope for this context and handle is committed and
    /// discarded first, unless `reuse_open` keeps the existing connection
    /// (issuing BEGIN only if no transaction is running on it).
    pub async fn begin(&self, ctx: &ContextId, handle: &Handle, reuse_open: bool) -> DbResult<()> {
        let key = Self::key(ctx, handle.id());
        if let Some(entry) = self.entry(&key) {
            if reuse_open {
                let mut st = entry.lock().await;
                if let Some(pc) = st.conn.as_mut() {
                    if !pc.tx_running() {
                        pc.conn_mut().begin().await?;
                        pc.set_tx_running(true);
                        st.began = true;
                    }
                    return Ok(());
                }
                return Err(DbError::statement(format!(
                    "transaction scope for handle '{handle}' has no connection"
                )));
            }
            debug!(handle = %handle, context = %ctx, "committing stale scope before begin");
            self.commit(ctx, handle, true).await?;
        }

        let state = self.inner.registry.lookup(handle)?;
        let mut pc = state.connector().acquire().await?;
        let mut began = false;
        if !pc.tx_running() {
            if let Err(e) = pc.conn_mut().begin().await {
                error!(handle = %handle, error = %e, "failed to start transaction");
                state.connector().discard(pc).await;
                return Err(e);
            }
            pc.set_tx_running(true);
            began = true;
        }
        if let Err(mut lost) = self.insert_scope(
            key,
            ScopeState {
                conn: Some(pc),
                began,
            },
        ) {
            if let Some(mut pc) = lost.conn.take() {
                let _ = pc.conn_mut().rollback().await;
                pc.set_tx_running(false);
                state.connector().release(pc).await;
            }
        }
        Ok(())
    }

    /// Commit the open scope. With `close` the connection is released and
    /// the scope removed; without it the connection stays checked out and a
    /// new transaction is started for further work.
    pub async fn commit(&self, ctx: &ContextId, handle: &Handle, close: bool) -> DbResult<()> {
        self.end_transaction(ctx, handle, true, close).await
    }

    /// Roll back the open scope. `close` as for [`commit`](Self::commit).
    pub async fn rollback(&self, ctx: &ContextId, handle: &Handle, close: bool) -> DbResult<()> {
        self.end_transaction(ctx, handle, false, close).await
    }

    async fn end_transaction(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        commit: bool,
        close: bool,
    ) -> DbResult<()> {
        let key = Self::key(ctx, handle.id());
        let entry = if close {
            self.inner.scopes.write().unwrap().remove(&key)
        } else {
            self.entry(&key)
        }
        .ok_or_else(|| {
            DbError::statement(format!("no open transaction scope for handle '{handle}'"))
        })?;

        let state = self.inner.registry.lookup(handle).ok();
        let mut st = entry.lock().await;
        let Some(pc) = st.conn.as_mut() else {
            return Err(DbError::statement(format!(
                "transaction scope for handle '{handle}' has no connection"
            )));
        };

        let op_result = if pc.tx_running() {
            if commit {
                pc.conn_mut().commit().await
            } else {
                pc.conn_mut().rollback().await
            }
        } else {
            Ok(())
        };

        match op_result {
            Ok(()) => {
                pc.set_tx_running(false);
                let removals = if commit {
                    pc.take_commit_removals()
                } else {
                    pc.take_rollback_removals()
                };
                run_removals(removals).await;
                if close {
                    let pc = st.conn.take().expect("connection present above");
                    match &state {
                        Some(s) => s.connector().release(pc).await,
                        None => pc.close().await,
                    }
                } else if let Some(s) = &state {
                    if !s.config().autocommit {
                        pc.conn_mut().begin().await?;
                        pc.set_tx_running(true);
                        st.began = true;
                    }
                }
                Ok(())
            }
            Err(e) => {
                if commit {
                    error!(handle = %handle, error = %e, "transaction commit failed");
                } else {
                    error!(handle = %handle, error = %e, "transaction rollback failed");
                }
                if close {
                    let pc = st.conn.take().expect("connection present above");
                    match &state {
                        Some(s) => s.connector().discard(pc).await,
                        None => pc.close().await,
                    }
                }
                Err(e)
            }
        }
    }

    /// Administrative sweep: force-commit every dangling scope and clear
    /// the map. A safety net for shutdown, not a normal code path.
    pub async fn cleanup_all(&self) {
        let drained: Vec<(ScopeKey, Arc<Mutex<ScopeState>>)> = {
            let mut scopes = self.inner.scopes.write().unwrap();
            scopes.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        warn!(scopes = drained.len(), "cleaning up dangling transaction scopes");
        for ((ctx, handle_id), entry) in drained {
            let mut st = entry.lock().await;
            let Some(mut pc) = st.conn.take() else {
                continue;
            };
            let mut broken = false;
            if pc.tx_running() {
                match pc.conn_mut().commit().await {
                    Ok(()) => {
                        pc.set_tx_running(false);
                        run_removals(pc.take_commit_removals()).await;
                    }
                    Err(e) => {
                        warn!(handle = %handle_id, context = %ctx, error = %e, "cleanup commit failed");
                        broken = true;
                    }
                }
            }
            match self.inner.registry.lookup_id(&handle_id) {
                Ok(state) if broken => state.connector().discard(pc).await,
                Ok(state) => state.connector().release(pc).await,
                Err(_) => pc.close().await,
            }
        }
    }

    /// Queue `path` for deletion when the open scope commits. With no open
    /// scope there is no transaction to defer to and the file is removed
    /// immediately.
    pub async fn remove_file_on_commit(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        path: impl Into<PathBuf>,
    ) {
        let path = path.into();
        if let Some(entry) = self.entry(&Self::key(ctx, handle.id())) {
            let mut st = entry.lock().await;
            if let Some(pc) = st.conn.as_mut() {
                pc.queue_remove_on_commit(path);
                return;
            }
        }
        run_removals(vec![path]).await;
    }

    /// Queue `path` for deletion when the open scope rolls back. With no
    /// open scope this is a no-op.
    pub async fn remove_file_on_rollback(
        &self,
        ctx: &ContextId,
        handle: &Handle,
        path: impl Into<PathBuf>,
    ) {
        let path = path.into();
        if let Some(entry) = self.entry(&Self::key(ctx, handle.id())) {
            let mut st = entry.lock().await;
            if let Some(pc) = st.conn.as_mut() {
                pc.queue_remove_on_rollback(path);
            }
        }
    }

    /// Lock the open scope's connection for statement execution.
    pub(crate) async fn scope_conn(
        &self,
        ctx: &ContextId,
        handle: &Handle,
    ) -> DbResult<ScopeConnGuard> {
        let entry = self.entry(&Self::key(ctx, handle.id())).ok_or_else(|| {
            DbError::statement(format!("no open transaction scope for handle '{handle}'"))
        })?;
        Ok(ScopeConnGuard {
            guard: entry.lock_owned().await,
        })
    }

    async fn close_scope(
        &self,
        ctx: &ContextId,
        handle_id: &str,
        owns: bool,
        success: bool,
        log_errors: bool,
    ) -> DbResult<()> {
        if !owns {
            return Ok(());
        }
        let key = Self::key(ctx, handle_id);
        let entry = { self.inner.scopes.write().unwrap().remove(&key) };
        let Some(entry) = entry else {
            return Ok(());
        };
        let mut st = entry.lock().await;
        let Some(mut pc) = st.conn.take() else {
            return Ok(());
        };
        let began = st.began;
        drop(st);

        let mut result = Ok(());
        let mut broken = false;
        if success && pc.tx_running() {
            match pc.conn_mut().commit().await {
                Ok(()) => {
                    pc.set_tx_running(false);
                    run_removals(pc.take_commit_removals()).await;
                }
                Err(e) => {
                    if log_errors {
                        error!(handle = %handle_id, error = %e, "transaction commit failed");
                    }
                    broken = true;
                    result = Err(e);
                }
            }
        } else if success {
            // Autocommit mode: each statement already committed.
            run_removals(pc.take_commit_removals()).await;
        } else if began {
            match pc.conn_mut().rollback().await {
                Ok(()) => {
                    pc.set_tx_running(false);
                    run_removals(pc.take_rollback_removals()).await;
                }
                Err(e) => {
                    if log_errors {
                        error!(handle = %handle_id, error = %e, "transaction rollback failed");
                    }
                    broken = true;
                    result = Err(e);
                }
            }
        }

        match self.inner.registry.lookup_id(handle_id) {
            Ok(state) if broken => state.connector().discard(pc).await,
            Ok(state) => state.connector().release(pc).await,
            Err(_) => pc.close().await,
        }
        result
    }
}

/// Borrowed access to a scope's connection during statement execution.
pub(crate) struct ScopeConnGuard {
    guard: OwnedMutexGuard<ScopeState>,
}

impl ScopeConnGuard {
    pub(crate) fn conn_mut(&mut self) -> DbResult<&mut PooledConnection> {
        self.guard
            .conn
            .as_mut()
            .ok_or_else(|| DbError::statement("transaction scope has no connection"))
    }
}

/// Guard over one scoped acquisition.
///
/// Call [`success`](Self::success) once the unit of work succeeded, then
/// [`close`](Self::close). A guard that is dropped instead - early return,
/// `?`, panic unwinding - still closes its scope (without success, so an
/// owned transaction rolls back) from a spawned task.
#[derive(Debug)]
pub struct ScopedConnection {
    mgr: TransactionManager,
    ctx: ContextId,
    handle: Handle,
    owns: bool,
    success: bool,
    log_errors: bool,
    closed: bool,
}

impl ScopedConnection {
    /// Whether this guard owns the scope's terminal outcome.
    pub fn owns(&self) -> bool {
        self.owns
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Mark the unit of work as succeeded. Without this, an owned scope
    /// rolls back on close.
    pub fn success(&mut self) {
        self.success = true;
    }

    pub(crate) async fn connection(&self) -> DbResult<ScopeConnGuard> {
        self.mgr.scope_conn(&self.ctx, &self.handle).await
    }

    /// Close the scope: commit or roll back if owned, release the
    /// connection, remove the scope entry.
    pub async fn close(mut self) -> DbResult<()> {
        self.closed = true;
        self.mgr
            .close_scope(
                &self.ctx,
                self.handle.id(),
                self.owns,
                self.success,
                self.log_errors,
            )
            .await
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if self.closed || !self.owns {
            return;
        }
        let mgr = self.mgr.clone();
        let ctx = self.ctx.clone();
        let handle_id = self.handle.id().to_string();
        let success = self.success;
        let log_errors = self.log_errors;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = mgr
                        .close_scope(&ctx, &handle_id, true, success, log_errors)
                        .await
                    {
                        warn!(handle = %handle_id, error = %e, "scope closed via drop");
                    }
                });
            }
            Err(_) => {
                warn!(handle = %handle_id, "scope dropped outside a runtime; connection not released");
            }
        }
    }
}

async fn run_removals(paths: Vec<PathBuf>) {
    for path in paths {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed deferred file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove deferred file"),
        }
    }
}
