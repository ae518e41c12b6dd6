//! Bounded warehouse connection pool.
//!
//! - At most `max_size` connections exist at any time; borrowers beyond that
//!   wait up to `acquire_timeout`.
//! - Every borrow runs a health check; a connection that fails it is closed
//!   and replaced transparently.
//! - Idle connections older than `idle_timeout` are evicted by a background
//!   task, keeping at least `min_size` open.
//! - A [`PooledConnection`] goes back to the pool when dropped, so the
//!   outstanding-borrow count returns to zero on every path, panics included.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use reportflow_core::RetryPolicy;

use crate::connection::{ConnectionFactory, QueryOptions, QueryResult};
use crate::error::WarehouseError;
use crate::retry::{RetryingConnection, retry_transient};

/// Pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections opened eagerly and kept through idle eviction.
    pub min_size: usize,
    /// Hard cap on open connections.
    pub max_size: usize,
    /// How long `acquire` waits for a free slot.
    pub acquire_timeout: Duration,
    /// Idle connections unused for longer than this are closed.
    pub idle_timeout: Duration,
    /// How often the evictor scans the idle list.
    pub eviction_interval: Duration,
    /// Retry policy applied to every connection operation.
    pub retry: RetryPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.min_size = self.min_size.min(self.max_size);
        self
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub acquisitions: u64,
    pub acquire_timeouts: u64,
    pub validation_failures: u64,
    pub size: usize,
    pub idle: usize,
    pub borrowed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    closed: AtomicU64,
    acquisitions: AtomicU64,
    acquire_timeouts: AtomicU64,
    validation_failures: AtomicU64,
}

struct IdleEntry {
    conn: RetryingConnection,
    last_used: Instant,
}

struct PoolInner {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<IdleEntry>>,
    permits: Arc<Semaphore>,
    size: AtomicUsize,
    borrowed: AtomicUsize,
    closed: AtomicBool,
    counters: Counters,
}

impl PoolInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, Vec<IdleEntry>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a session and check it before anyone gets to use it.
    async fn open(&self) -> Result<RetryingConnection, WarehouseError> {
        let policy = self.config.retry;
        let opened = retry_transient(&policy, "open connection", move || self.factory.connect())
            .await
            .map_err(into_unavailable)?;

        let conn = RetryingConnection::new(opened.value, policy);
        self.size.fetch_add(1, Ordering::SeqCst);
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        match conn.is_valid().await {
            Ok(true) => Ok(conn),
            Ok(false) => {
                self.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
                self.close_connection(conn).await;
                Err(WarehouseError::DataSourceUnavailable {
                    attempts: opened.attempts,
                    source: crate::error::DriverError::without_status(
                        "new connection failed its health check",
                    ),
                })
            }
            Err(err) => {
                self.close_connection(conn).await;
                Err(into_unavailable(err))
            }
        }
    }

    async fn close_connection(&self, conn: RetryingConnection) {
        if let Err(err) = conn.close().await {
            warn!(error = %err, "failed to close warehouse connection");
        }
        self.size.fetch_sub(1, Ordering::SeqCst);
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Called from `PooledConnection::drop`; must not await.
    fn give_back(self: &Arc<Self>, conn: RetryingConnection) {
        self.borrowed.fetch_sub(1, Ordering::SeqCst);

        if !self.closed.load(Ordering::SeqCst) {
            self.idle().push(IdleEntry {
                conn,
                last_used: Instant::now(),
            });
            return;
        }

        // Returned after drain: close in the background if a runtime is around.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move { pool.close_connection(conn).await });
            }
            Err(_) => {
                self.size.fetch_sub(1, Ordering::SeqCst);
                self.counters.closed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn into_unavailable(err: WarehouseError) -> WarehouseError {
    match err {
        WarehouseError::QueryExecution {
            attempts, source, ..
        } => WarehouseError::DataSourceUnavailable { attempts, source },
        other => other,
    }
}

/// Handle to a shared connection pool. Cloning is cheap.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl core::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Build a pool and eagerly open `min_size` connections.
    ///
    /// Failing to pre-open connections is logged, not fatal: the pool opens
    /// connections lazily on demand anyway.
    pub async fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let config = config.normalized();
        let pool = Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_size)),
                idle: Mutex::new(Vec::with_capacity(config.max_size)),
                config,
                factory,
                size: AtomicUsize::new(0),
                borrowed: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        };

        for _ in 0..pool.inner.config.min_size {
            match pool.inner.open().await {
                Ok(conn) => {
                    pool.inner.idle().push(IdleEntry {
                        conn,
                        last_used: Instant::now(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "failed to pre-open warehouse connection");
                    break;
                }
            }
        }

        info!(
            min_size = pool.inner.config.min_size,
            max_size = pool.inner.config.max_size,
            open = pool.size(),
            "warehouse connection pool ready"
        );
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Borrow a validated connection, waiting up to `acquire_timeout` for a
    /// free slot.
    pub async fn acquire(&self) -> Result<PooledConnection, WarehouseError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(WarehouseError::NotInstantiated);
        }

        let timeout = inner.config.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, Arc::clone(&inner.permits).acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(WarehouseError::NotInstantiated),
            Err(_elapsed) => {
                inner.counters.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(WarehouseError::AcquireTimeout(timeout));
            }
        };

        let conn = loop {
            let candidate = inner.idle().pop();
            let Some(entry) = candidate else {
                break inner.open().await?;
            };

            match entry.conn.is_valid().await {
                Ok(true) => break entry.conn,
                Ok(false) => {
                    debug!("idle warehouse connection failed validation, replacing it");
                }
                Err(err) => {
                    debug!(error = %err, "idle warehouse connection validation errored, replacing it");
                }
            }
            inner.counters.validation_failures.fetch_add(1, Ordering::Relaxed);
            inner.close_connection(entry.conn).await;
        };

        inner.borrowed.fetch_add(1, Ordering::SeqCst);
        inner.counters.acquisitions.fetch_add(1, Ordering::Relaxed);

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(inner),
            _permit: permit,
        })
    }

    /// Hand a connection back for reuse.
    pub fn release(&self, conn: PooledConnection) {
        conn.release();
    }

    /// Close a connection instead of returning it.
    pub async fn destroy(&self, conn: PooledConnection) {
        conn.destroy().await;
    }

    /// Close idle connections unused for longer than `idle_timeout`, keeping
    /// at least `min_size` connections open. Returns how many were closed.
    pub async fn evict_idle(&self) -> usize {
        let inner = &self.inner;
        let expired: Vec<IdleEntry> = {
            let mut idle = inner.idle();
            let mut removable = inner.size.load(Ordering::SeqCst).saturating_sub(inner.config.min_size);
            let mut expired = Vec::new();
            let mut kept = Vec::with_capacity(idle.len());
            for entry in idle.drain(..) {
                if removable > 0 && entry.last_used.elapsed() > inner.config.idle_timeout {
                    removable -= 1;
                    expired.push(entry);
                } else {
                    kept.push(entry);
                }
            }
            *idle = kept;
            expired
        };

        let count = expired.len();
        for entry in expired {
            inner.close_connection(entry.conn).await;
        }
        if count > 0 {
            debug!(evicted = count, "evicted idle warehouse connections");
        }
        count
    }

    /// Run [`Self::evict_idle`] every `eviction_interval` until the pool is drained.
    pub fn spawn_evictor(&self) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.inner.config.eviction_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                pool.evict_idle().await;
            }
        })
    }

    /// Stop handing out connections and close every idle one. Connections
    /// still borrowed are closed as they come back.
    pub async fn drain(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.permits.close();

        let idle: Vec<IdleEntry> = inner.idle().drain(..).collect();
        for entry in idle {
            inner.close_connection(entry.conn).await;
        }
        info!(
            still_borrowed = self.borrowed(),
            "warehouse connection pool drained"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Connections currently borrowed and not yet returned.
    pub fn borrowed(&self) -> usize {
        self.inner.borrowed.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> usize {
        self.inner.idle().len()
    }

    /// Open connections, idle or borrowed.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            connections_created: c.created.load(Ordering::Relaxed),
            connections_closed: c.closed.load(Ordering::Relaxed),
            acquisitions: c.acquisitions.load(Ordering::Relaxed),
            acquire_timeouts: c.acquire_timeouts.load(Ordering::Relaxed),
            validation_failures: c.validation_failures.load(Ordering::Relaxed),
            size: self.size(),
            idle: self.idle(),
            borrowed: self.borrowed(),
        }
    }
}

/// A connection borrowed from the pool. Returned to the pool on drop.
pub struct PooledConnection {
    conn: Option<RetryingConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl core::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn conn(&self) -> Result<&RetryingConnection, WarehouseError> {
        self.conn.as_ref().ok_or(WarehouseError::NotInstantiated)
    }

    pub async fn run_query(
        &self,
        sql: &str,
        options: QueryOptions,
    ) -> Result<QueryResult, WarehouseError> {
        self.conn()?.run_query(sql, options).await
    }

    pub async fn query_status(&self, query_id: &str) -> Result<String, WarehouseError> {
        self.conn()?.query_status(query_id).await
    }

    pub fn is_still_running(&self, status: &str) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|c| c.is_still_running(status))
    }

    pub fn is_error_status(&self, status: &str) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|c| c.is_error_status(status))
    }

    /// Return the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it.
    pub async fn destroy(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.borrowed.fetch_sub(1, Ordering::SeqCst);
            self.pool.close_connection(conn).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use crate::testing::FakeWarehouse;

    fn config() -> PoolConfig {
        PoolConfig::default()
            .with_min_size(1)
            .with_max_size(2)
            .with_acquire_timeout(Duration::from_secs(1))
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn prewarms_min_size_connections() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config().with_min_size(2), warehouse.factory()).await;

        assert_eq!(pool.size(), 2);
        assert_eq!(pool.idle(), 2);
        assert_eq!(warehouse.connects(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn released_connections_are_reused() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config(), warehouse.factory()).await;

        let conn = pool.acquire().await.unwrap();
        assert_eq!(pool.borrowed(), 1);
        pool.release(conn);
        assert_eq!(pool.borrowed(), 0);

        let _again = pool.acquire().await.unwrap();
        assert_eq!(warehouse.connects(), 1);
        assert_eq!(pool.stats().acquisitions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_idle_connection_is_replaced() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config(), warehouse.factory()).await;
        warehouse.invalidate_next(1);

        let conn = pool.acquire().await.unwrap();

        assert_eq!(warehouse.connects(), 2);
        assert_eq!(warehouse.closes(), 1);
        assert_eq!(pool.stats().validation_failures, 1);
        assert_eq!(pool.size(), 1);
        drop(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_times_out_when_exhausted() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config(), warehouse.factory()).await;

        let _a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, WarehouseError::AcquireTimeout(_)));
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_borrower_gets_released_connection() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config().with_max_size(1), warehouse.factory()).await;

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|c| c.release()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        held.release();

        waiter.await.unwrap().unwrap();
        assert_eq!(pool.borrowed(), 0);
        assert_eq!(warehouse.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn creation_failure_surfaces_as_data_source_unavailable() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config().with_min_size(0), warehouse.factory()).await;
        for _ in 0..3 {
            warehouse.fail_next_connect(DriverError::new(503, "warehouse down"));
        }

        let err = pool.acquire().await.unwrap_err();

        match err {
            WarehouseError::DataSourceUnavailable { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected DataSourceUnavailable, got {other:?}"),
        }
        assert_eq!(pool.borrowed(), 0);

        // The slot was released with the failed attempt.
        let _conn = pool.acquire().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_closes_instead_of_returning() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config(), warehouse.factory()).await;

        let conn = pool.acquire().await.unwrap();
        pool.destroy(conn).await;

        assert_eq!(pool.borrowed(), 0);
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.idle(), 0);
        assert_eq!(warehouse.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_keeps_min_size() {
        let warehouse = FakeWarehouse::new();
        let cfg = config()
            .with_max_size(3)
            .with_idle_timeout(Duration::from_secs(60));
        let pool = ConnectionPool::new(cfg, warehouse.factory()).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        drop((a, b, c));
        assert_eq!(pool.idle(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        let evicted = pool.evict_idle().await;

        assert_eq!(evicted, 2);
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drained_pool_refuses_borrowers() {
        let warehouse = FakeWarehouse::new();
        let pool = ConnectionPool::new(config(), warehouse.factory()).await;

        pool.drain().await;

        assert!(pool.is_closed());
        assert_eq!(pool.size(), 0);
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            WarehouseError::NotInstantiated
        ));
    }
}
