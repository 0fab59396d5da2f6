//! Bounded connection pool over any [`Connector`].
//!
//! The pool caps the number of live connections it has created. Renting
//! prefers an idle connection, then creates one while below the cap, and
//! otherwise waits for a return. Returns never block: idle connections go
//! through a bounded channel with `try_send`, and anything that does not fit
//! (or is broken) is closed and stops counting against the cap.
//!
//! A slot reserved for an open that never finishes is released when the
//! rent future is dropped. A lease dropped in the middle of a command is
//! treated as broken.

use crate::db::connection::{Command, Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, Request, ResultSet};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Notify;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub live: usize,
    pub idle: usize,
    pub created: u64,
    pub discarded: u64,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    max_size: usize,
    live: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
    idle_tx: mpsc::Sender<Box<dyn Connection>>,
    idle_rx: Mutex<mpsc::Receiver<Box<dyn Connection>>>,
    returned: Notify,
}

impl PoolInner {
    fn take_idle(&self) -> Option<Box<dyn Connection>> {
        self.idle_rx.lock().try_recv().ok()
    }

    /// Reserve a slot for a new connection if below the cap.
    fn reserve(&self) -> Option<Reservation<'_>> {
        let mut live = self.live.load(Ordering::Acquire);
        while live < self.max_size {
            match self.live.compare_exchange_weak(
                live,
                live + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        pool: self,
                        filled: false,
                    });
                }
                Err(actual) => live = actual,
            }
        }
        None
    }

    fn free_slot(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.returned.notify_waiters();
    }

    /// Hand a connection back. Returns it when it must be closed instead.
    fn give_back(&self, conn: Box<dyn Connection>) -> Option<Box<dyn Connection>> {
        if conn.is_broken() {
            debug!(connector = self.connector.name(), "Discarding broken connection");
            self.discarded.fetch_add(1, Ordering::Relaxed);
            self.free_slot();
            return Some(conn);
        }

        match self.idle_tx.try_send(conn) {
            Ok(()) => {
                self.returned.notify_waiters();
                None
            }
            Err(TrySendError::Full(conn)) | Err(TrySendError::Closed(conn)) => {
                debug!(connector = self.connector.name(), "Idle queue full, closing connection");
                self.discarded.fetch_add(1, Ordering::Relaxed);
                self.free_slot();
                Some(conn)
            }
        }
    }
}

/// A counted slot. Freed on drop unless a connection was opened into it.
struct Reservation<'a> {
    pool: &'a PoolInner,
    filled: bool,
}

impl Reservation<'_> {
    fn fill(mut self) {
        self.filled = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.pool.free_slot();
        }
    }
}

/// A bounded pool of connections from one connector.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connector", &self.inner.connector.name())
            .field("max_size", &self.inner.max_size)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool holding at most `max_size` live connections.
    pub fn new(connector: Arc<dyn Connector>, max_size: usize) -> DbResult<Self> {
        if max_size == 0 {
            return Err(DbError::invalid_argument(
                "Connection pool size must be at least 1",
            ));
        }
        let (idle_tx, idle_rx) = mpsc::channel(max_size);
        Ok(Self {
            inner: Arc::new(PoolInner {
                connector,
                max_size,
                live: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
                returned: Notify::new(),
            }),
        })
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            live: inner.live.load(Ordering::Acquire),
            idle: inner.idle_tx.max_capacity() - inner.idle_tx.capacity(),
            created: inner.created.load(Ordering::Relaxed),
            discarded: inner.discarded.load(Ordering::Relaxed),
        }
    }

    async fn try_rent(&self) -> DbResult<Option<PooledLease>> {
        if let Some(conn) = self.inner.take_idle() {
            return Ok(Some(self.lease(conn)));
        }
        let Some(slot) = self.inner.reserve() else {
            return Ok(None);
        };
        let conn = self.inner.connector.open().await?;
        slot.fill();
        self.inner.created.fetch_add(1, Ordering::Relaxed);
        Ok(Some(self.lease(conn)))
    }

    /// Rent a connection, waiting for a return while the pool is exhausted.
    pub async fn rent(&self) -> DbResult<PooledLease> {
        loop {
            // Register interest before checking so a return in between is not missed
            let notified = self.inner.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_rent().await? {
                return Ok(lease);
            }
            debug!(
                connector = self.inner.connector.name(),
                max_size = self.inner.max_size,
                "Pool exhausted, waiting for a return"
            );
            notified.await;
        }
    }

    fn lease(&self, conn: Box<dyn Connection>) -> PooledLease {
        PooledLease {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            busy: false,
        }
    }
}

#[async_trait]
impl Connector for ConnectionPool {
    fn name(&self) -> &str {
        self.inner.connector.name()
    }

    async fn open(&self) -> DbResult<Box<dyn Connection>> {
        Ok(Box::new(self.rent().await?))
    }

    fn build_command(&self, request: &Request) -> DbResult<Command> {
        self.inner.connector.build_command(request)
    }
}

/// A rented connection. Closing or dropping it returns it to the pool.
pub struct PooledLease {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    /// Set while a command is awaiting the connection
    busy: bool,
}

impl std::fmt::Debug for PooledLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledLease")
            .field("connector", &self.pool.connector.name())
            .field("released", &self.conn.is_none())
            .finish()
    }
}

impl PooledLease {
    /// The connection, flagged busy until the caller clears it.
    fn checkout(&mut self) -> DbResult<&mut Box<dyn Connection>> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| DbError::object_disposed("pooled connection"))?;
        self.busy = true;
        Ok(conn)
    }

    fn settle<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        self.busy = false;
        result
    }
}

#[async_trait]
impl Connection for PooledLease {
    async fn query(&mut self, command: &Command) -> DbResult<Vec<ResultSet>> {
        let result = self.checkout()?.query(command).await;
        self.settle(result)
    }

    async fn execute(&mut self, command: &Command) -> DbResult<u64> {
        let result = self.checkout()?.execute(command).await;
        self.settle(result)
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> DbResult<()> {
        let result = self.checkout()?.begin(isolation).await;
        self.settle(result)
    }

    async fn commit(&mut self) -> DbResult<()> {
        let result = self.checkout()?.commit().await;
        self.settle(result)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let result = self.checkout()?.rollback().await;
        self.settle(result)
    }

    /// Return the connection to the pool.
    async fn close(&mut self) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        match self.pool.give_back(conn) {
            Some(mut discarded) => discarded.close().await,
            None => Ok(()),
        }
    }

    fn is_broken(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.is_broken())
    }

    fn mark_broken(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_broken();
        }
    }
}

impl Drop for PooledLease {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if self.busy {
            warn!(
                connector = self.pool.connector.name(),
                "Lease dropped mid-command, discarding its connection"
            );
            conn.mark_broken();
        }
        if let Some(mut discarded) = self.pool.give_back(conn) {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = discarded.close().await {
                        warn!(error = %e, "Failed to close discarded connection");
                    }
                });
            }
        }
    }
}
