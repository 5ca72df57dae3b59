//! Fixed-capacity connection pool.
//!
//! The pool keeps a stack of idle slots and a counter of slots ever
//! allocated, bounded by the configured maximum. Capacity is enforced with a
//! semaphore: an acquire that finds no free slot and no headroom waits until
//! a release returns a permit (optionally bounded, surfacing
//! `ResourceExhausted` on expiry). Waiter wake order is unspecified.
//!
//! # Concurrency Safety
//!
//! - The idle list and allocation counter sit behind a `std::sync::Mutex`
//!   that is never held across an await point.
//! - A slot whose connection failed is pushed back empty, so connect
//!   failures return capacity instead of leaking it.
//! - Physical connect/close runs outside all locks.

use crate::config::PoolOptions;
use crate::db::conn::{ConnectSpec, DbConn, DbKind};
use crate::error::{DbError, DbResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Slot index marker for connections that are not pool-managed.
pub const UNTRACKED_SLOT: i64 = -1;

/// One physical connection plus pool bookkeeping.
///
/// Carries the slot index (−1 for non-indexed connectors), the
/// running-transaction flag and the queues of file paths to remove when the
/// transaction that referenced them commits or rolls back.
#[derive(Debug)]
pub struct PooledConnection {
    conn: DbConn,
    slot: i64,
    tx_running: bool,
    on_commit: Vec<PathBuf>,
    on_rollback: Vec<PathBuf>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledConnection {
    pub(crate) fn new(conn: DbConn, slot: i64, permit: Option<OwnedSemaphorePermit>) -> Self {
        Self {
            conn,
            slot,
            tx_running: false,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
            permit,
        }
    }

    /// Wrap a connection that is not tracked by any pool slot.
    pub(crate) fn untracked(conn: DbConn) -> Self {
        Self::new(conn, UNTRACKED_SLOT, None)
    }

    pub fn kind(&self) -> DbKind {
        self.conn.kind()
    }

    pub fn slot(&self) -> i64 {
        self.slot
    }

    pub fn conn_mut(&mut self) -> &mut DbConn {
        &mut self.conn
    }

    /// Whether a logical transaction is open on this connection.
    pub fn tx_running(&self) -> bool {
        self.tx_running
    }

    pub(crate) fn set_tx_running(&mut self, running: bool) {
        self.tx_running = running;
    }

    /// Queue a file to be removed when the transaction commits.
    pub(crate) fn queue_remove_on_commit(&mut self, path: PathBuf) {
        self.on_commit.push(path);
    }

    /// Queue a file to be removed when the transaction rolls back.
    pub(crate) fn queue_remove_on_rollback(&mut self, path: PathBuf) {
        self.on_rollback.push(path);
    }

    /// Take the queued on-commit removals, dropping the rollback queue.
    pub(crate) fn take_commit_removals(&mut self) -> Vec<PathBuf> {
        self.on_rollback.clear();
        std::mem::take(&mut self.on_commit)
    }

    /// Take the queued on-rollback removals, dropping the commit queue.
    pub(crate) fn take_rollback_removals(&mut self) -> Vec<PathBuf> {
        self.on_commit.clear();
        std::mem::take(&mut self.on_rollback)
    }

    /// Physically close the connection, abandoning any slot bookkeeping.
    pub(crate) async fn close(self) {
        self.conn.close().await;
        // permit (if any) drops here and returns capacity
    }

    pub(crate) fn into_parts(self) -> (DbConn, i64, Option<OwnedSemaphorePermit>) {
        (self.conn, self.slot, self.permit)
    }
}

/// An idle pool slot. `conn` is `None` when the slot's previous connection
/// failed and the next borrower must reconnect.
#[derive(Debug)]
struct IdleSlot {
    slot: i64,
    conn: Option<DbConn>,
}

#[derive(Debug)]
struct PoolState {
    idle: Vec<IdleSlot>,
    /// Slots ever allocated; never exceeds the configured maximum.
    allocated: usize,
    closed: bool,
}

/// Bounded pool of physical connections for one handle.
#[derive(Debug, Clone)]
pub struct FixedPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    spec: ConnectSpec,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    test_before_acquire: bool,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    /// Connections currently checked out; diagnostics only.
    checked_out: AtomicUsize,
}

impl FixedPool {
    /// Create a pool for `spec` sized and tuned by `options`.
    pub fn new(spec: ConnectSpec, options: &PoolOptions) -> Self {
        let capacity = options.max_connections_or_default() as usize;
        Self {
            inner: Arc::new(PoolInner {
                spec,
                capacity,
                acquire_timeout: options.acquire_timeout(),
                test_before_acquire: options.test_before_acquire_or_default(),
                semaphore: Arc::new(Semaphore::new(capacity)),
                state: Mutex::new(PoolState {
                    idle: Vec::with_capacity(capacity),
                    allocated: 0,
                    closed: false,
                }),
                checked_out: AtomicUsize::new(0),
            }),
        }
    }

    pub fn kind(&self) -> DbKind {
        self.inner.spec.kind
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.checked_out.load(Ordering::Acquire)
    }

    /// Slots ever allocated.
    pub fn allocated(&self) -> usize {
        self.inner.state.lock().unwrap().allocated
    }

    /// Borrow a connection, waiting for a free slot when the pool is at
    /// capacity.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        let permit = self.wait_for_permit().await?;

        // A permit guarantees a slot: either an idle one or headroom for a
        // new allocation. The mutex is released before any connect I/O.
        let popped = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Err(DbError::connect("connection pool is shut down"));
            }
            match state.idle.pop() {
                Some(slot) => slot,
                None => {
                    let slot = state.allocated as i64;
                    state.allocated += 1;
                    IdleSlot { slot, conn: None }
                }
            }
        };

        let slot = popped.slot;
        let conn = match popped.conn {
            Some(mut conn) if self.inner.test_before_acquire => match conn.ping().await {
                Ok(()) => conn,
                Err(e) => {
                    debug!(slot, error = %e, "pooled connection is stale, reconnecting");
                    conn.close().await;
                    self.connect_slot(slot).await?
                }
            },
            Some(conn) => conn,
            None => self.connect_slot(slot).await?,
        };

        self.inner.checked_out.fetch_add(1, Ordering::AcqRel);
        Ok(PooledConnection::new(conn, slot, Some(permit)))
    }

    /// Return a connection to the pool and wake one waiter.
    pub async fn release(&self, pc: PooledConnection) {
        let (conn, slot, permit) = pc.into_parts();
        self.inner.checked_out.fetch_sub(1, Ordering::AcqRel);

        let closed = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.closed {
                state.idle.push(IdleSlot {
                    slot,
                    conn: Some(conn),
                });
                drop(permit);
                return;
            }
            true
        };
        if closed {
            conn.close().await;
            drop(permit);
        }
    }

    /// Physically close a borrowed connection while keeping its slot in the
    /// free list. Used when the connection's state is no longer trustworthy
    /// (e.g. a failed commit); the next borrower of the slot reconnects.
    pub async fn discard(&self, pc: PooledConnection) {
        let (conn, slot, permit) = pc.into_parts();
        self.inner.checked_out.fetch_sub(1, Ordering::AcqRel);
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.closed {
                state.idle.push(IdleSlot { slot, conn: None });
            }
        }
        conn.close().await;
        drop(permit);
    }

    /// Close every idle connection and fail all subsequent acquires.
    pub async fn shutdown(&self) {
        self.inner.semaphore.close();
        let idle = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        let count = idle.len();
        for slot in idle {
            if let Some(conn) = slot.conn {
                conn.close().await;
            }
        }
        info!(closed = count, "connection pool shut down");
    }

    async fn wait_for_permit(&self) -> DbResult<OwnedSemaphorePermit> {
        let semaphore = Arc::clone(&self.inner.semaphore);
        let acquired = match self.inner.acquire_timeout {
            Some(bound) => match tokio::time::timeout(bound, semaphore.acquire_owned()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(DbError::resource_exhausted(format!(
                        "no free slot within {}s (capacity {})",
                        bound.as_secs(),
                        self.inner.capacity
                    )));
                }
            },
            None => semaphore.acquire_owned().await,
        };
        acquired.map_err(|_| DbError::connect("connection pool is shut down"))
    }

    /// Open a fresh physical connection for `slot`. On failure the empty
    /// slot returns to the free list so capacity is never leaked.
    async fn connect_slot(&self, slot: i64) -> DbResult<DbConn> {
        match DbConn::connect(&self.inner.spec).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                warn!(slot, url = %self.inner.spec.masked_url(), error = %e, "connect failed");
                let mut state = self.inner.state.lock().unwrap();
                if !state.closed {
                    state.idle.push(IdleSlot { slot, conn: None });
                }
                Err(e)
            }
        }
    }
}
