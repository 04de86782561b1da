//! Session pool
//!
//! Bounded set of cluster sessions with:
//! - Semaphore-based backpressure: `apply` waits only when every worker is busy
//! - Lazy session creation, failing over across the configured masters
//! - Operation deadline around every call (socket-read timeouts are enforced
//!   by the session itself)
//! - Table schema cache
//! - Statistics and graceful shutdown
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = SessionPool::connect(
//!     PoolConfig::new(MasterAddress::parse_list("m1:7051,m2:7051")?).with_max_sessions(8),
//!     Arc::new(cluster.connector()),
//! ).await?;
//!
//! let handle = pool.apply(mutation).await?; // waits for a free worker
//! handle.await?;                            // waits for the server
//! ```

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{ClusterConnector, MasterAddress, Session, SessionOptions};
use crate::error::{ConnectError, Result};
use crate::mutation::RowMutation;
use crate::schema::TableSchema;

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Master quorum, tried in order on session creation
    pub masters: Vec<MasterAddress>,
    /// Maximum number of concurrent sessions (worker count)
    pub max_sessions: usize,
    /// Timeouts handed to each session
    pub session: SessionOptions,
}

impl PoolConfig {
    pub fn new(masters: Vec<MasterAddress>) -> Self {
        Self {
            masters,
            max_sessions: default_max_sessions(),
            session: SessionOptions::default(),
        }
    }

    /// Set maximum pool size
    pub fn with_max_sessions(mut self, size: usize) -> Self {
        self.max_sessions = size;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.session.operation_timeout = timeout;
        self
    }

    pub fn with_socket_read_timeout(mut self, timeout: Duration) -> Self {
        self.session.socket_read_timeout = timeout;
        self
    }
}

/// Twice the available parallelism
pub fn default_max_sessions() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 2
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Total number of sessions opened
    pub sessions_created: u64,
    /// Total number of sessions closed or discarded
    pub sessions_closed: u64,
    /// Total number of apply calls dispatched
    pub applies: u64,
    /// Apply calls that returned an error
    pub apply_failures: u64,
    /// Calls that hit the operation deadline
    pub timeouts: u64,
    /// Total time spent waiting for a free worker (in milliseconds)
    pub total_wait_time_ms: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub sessions_created: AtomicU64,
    pub sessions_closed: AtomicU64,
    pub applies: AtomicU64,
    pub apply_failures: AtomicU64,
    pub timeouts: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_closed(&self) {
        self.sessions_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched apply and how long it waited for a worker
    pub fn record_apply(&self, wait_time_ms: u64) {
        self.applies.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.apply_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            applies: self.applies.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }

    /// Calculate average wait time in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        let applies = self.applies.load(Ordering::Relaxed);
        if applies == 0 {
            0.0
        } else {
            self.total_wait_time_ms.load(Ordering::Relaxed) as f64 / applies as f64
        }
    }
}

/// Pending result of [`SessionPool::apply`]
///
/// Dropping the handle before it resolves aborts the call, so a cancelled
/// batch leaves no write running behind it.
#[derive(Debug)]
pub struct ApplyHandle {
    handle: JoinHandle<Result<()>>,
}

impl ApplyHandle {
    /// Abort the call; awaiting the handle afterwards yields `Shutdown`
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for ApplyHandle {
    fn drop(&mut self) {
        // no-op once the call finished
        self.abort();
    }
}

impl Future for ApplyHandle {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(ConnectError::Shutdown),
            Err(e) => Err(ConnectError::Internal(format!("apply task failed: {}", e))),
        })
    }
}

/// Bounded pool of cluster sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn ClusterConnector>,
    /// Idle sessions (LIFO)
    idle: Mutex<Vec<Box<dyn Session>>>,
    /// One permit per worker
    semaphore: Arc<Semaphore>,
    schemas: RwLock<HashMap<String, Arc<TableSchema>>>,
    /// Index of the master that last accepted a session
    preferred_master: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.inner.config)
            .field("available", &self.inner.semaphore.available_permits())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionPool {
    /// Create the pool and open one session eagerly, so an unreachable
    /// quorum fails at startup rather than on the first write.
    pub async fn connect(config: PoolConfig, connector: Arc<dyn ClusterConnector>) -> Result<Self> {
        if config.masters.is_empty() {
            return Err(ConnectError::config("no master addresses configured"));
        }
        if config.max_sessions == 0 {
            return Err(ConnectError::config("session pool needs at least one worker"));
        }

        let pool = Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max_sessions)),
                idle: Mutex::new(Vec::with_capacity(config.max_sessions)),
                schemas: RwLock::new(HashMap::new()),
                preferred_master: AtomicUsize::new(0),
                stats: AtomicPoolStats::new(),
                shutdown: AtomicBool::new(false),
                connector,
                config,
            }),
        };

        let session = pool.inner.open_session().await?;
        pool.inner.idle.lock().await.push(session);

        info!(
            masters = pool.inner.config.masters.len(),
            max_sessions = pool.inner.config.max_sessions,
            "Session pool connected"
        );
        Ok(pool)
    }

    /// Dispatch a mutation. Waits for a free worker, then returns a handle
    /// resolving to the per-row outcome.
    pub async fn apply(&self, mutation: RowMutation) -> Result<ApplyHandle> {
        let start = Instant::now();
        let permit = self.inner.acquire().await?;
        let waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.inner.stats.record_apply(waited_ms);

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let result = inner.execute(&mutation).await;
            if result.is_err() {
                inner.stats.record_failure();
            }
            result
        });

        Ok(ApplyHandle { handle })
    }

    /// Schema of a table, fetched once through a session and cached
    pub async fn table_schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        let cached = self.inner.schemas.read().get(table).cloned();
        if let Some(schema) = cached {
            return Ok(schema);
        }

        let _permit = self.inner.acquire().await?;
        let schema = Arc::new(self.inner.fetch_schema(table).await?);
        self.inner
            .schemas
            .write()
            .insert(table.to_string(), schema.clone());

        debug!(table = %table, columns = schema.columns().len(), "Cached table schema");
        Ok(schema)
    }

    /// Forget a cached schema so the next lookup refetches it
    pub fn invalidate_schema(&self, table: &str) {
        self.inner.schemas.write().remove(table);
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.config.max_sessions
    }

    /// Workers currently free
    pub fn available(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Reject new calls and close idle sessions. Sessions still in use are
    /// closed when their call returns.
    pub async fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();

        let sessions: Vec<_> = self.inner.idle.lock().await.drain(..).collect();
        for session in sessions {
            self.inner.close_session(session).await;
        }

        let stats = self.inner.stats.snapshot();
        info!(
            sessions_created = stats.sessions_created,
            applies = stats.applies,
            timeouts = stats.timeouts,
            "Session pool closed"
        );
    }
}

impl PoolInner {
    async fn acquire(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConnectError::Shutdown);
        }
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConnectError::Shutdown)
    }

    async fn execute(&self, mutation: &RowMutation) -> Result<()> {
        let timeout = self.config.session.operation_timeout;
        let deadline = Instant::now() + timeout;

        let session = match tokio::time::timeout_at(deadline, self.checkout()).await {
            Ok(session) => session?,
            Err(_) => return Err(self.timed_out(mutation.table(), timeout)),
        };

        match tokio::time::timeout_at(deadline, session.apply(mutation)).await {
            Ok(Ok(())) => {
                self.checkin(session).await;
                Ok(())
            }
            Ok(Err(e)) => {
                self.release(session).await;
                Err(e.into_write_error())
            }
            Err(_) => {
                // the session state is unknown after an abandoned call
                self.close_session(session).await;
                Err(self.timed_out(mutation.table(), timeout))
            }
        }
    }

    async fn fetch_schema(&self, table: &str) -> Result<TableSchema> {
        let timeout = self.config.session.operation_timeout;
        let deadline = Instant::now() + timeout;

        let session = match tokio::time::timeout_at(deadline, self.checkout()).await {
            Ok(session) => session?,
            Err(_) => return Err(self.timed_out(table, timeout)),
        };

        match tokio::time::timeout_at(deadline, session.table_schema(table)).await {
            Ok(Ok(schema)) => {
                self.checkin(session).await;
                Ok(schema)
            }
            Ok(Err(e)) => {
                self.release(session).await;
                Err(e)
            }
            Err(_) => {
                self.close_session(session).await;
                Err(self.timed_out(table, timeout))
            }
        }
    }

    fn timed_out(&self, table: &str, timeout: Duration) -> ConnectError {
        self.stats.record_timeout();
        ConnectError::transient(format!(
            "operation on table '{}' timed out after {}ms",
            table,
            timeout.as_millis()
        ))
    }

    /// Take an idle session or open a new one
    async fn checkout(&self) -> Result<Box<dyn Session>> {
        loop {
            let candidate = self.idle.lock().await.pop();
            match candidate {
                Some(session) if session.is_valid().await => return Ok(session),
                Some(session) => self.close_session(session).await,
                None => return self.open_session().await,
            }
        }
    }

    async fn checkin(&self, session: Box<dyn Session>) {
        if self.shutdown.load(Ordering::Acquire) {
            self.close_session(session).await;
            return;
        }
        self.idle.lock().await.push(session);
    }

    /// Return a session after an error, discarding it if it went bad
    async fn release(&self, session: Box<dyn Session>) {
        if session.is_valid().await {
            self.checkin(session).await;
        } else {
            debug!("Discarding invalid session");
            self.close_session(session).await;
        }
    }

    async fn close_session(&self, session: Box<dyn Session>) {
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close session");
        }
        self.stats.record_closed();
    }

    /// Open a session, starting from the master that last worked and
    /// failing over through the rest of the quorum.
    async fn open_session(&self) -> Result<Box<dyn Session>> {
        let masters = &self.config.masters;
        let start = self.preferred_master.load(Ordering::Relaxed) % masters.len();
        let mut failures = Vec::with_capacity(masters.len());

        for i in 0..masters.len() {
            let index = (start + i) % masters.len();
            let master = &masters[index];

            let attempt = tokio::time::timeout(
                self.config.session.operation_timeout,
                self.connector.connect(master, &self.config.session),
            )
            .await;

            match attempt {
                Ok(Ok(session)) => {
                    self.preferred_master.store(index, Ordering::Relaxed);
                    self.stats.record_created();
                    debug!(master = %master, "Opened session");
                    return Ok(session);
                }
                Ok(Err(e)) => {
                    warn!(master = %master, error = %e, "Failed to open session");
                    failures.push(format!("{}: {}", master, e));
                }
                Err(_) => {
                    warn!(master = %master, "Timed out opening session");
                    failures.push(format!("{}: timed out", master));
                }
            }
        }

        Err(ConnectError::fatal_connection(format!(
            "no master reachable [{}]",
            failures.join("; ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::memory::{Fault, MemoryCluster};
    use crate::mutation::{Cell, OperationKind, RecordRef};
    use crate::record::TopicPartition;
    use crate::schema::{ColumnSchema, ColumnType};

    fn cluster() -> MemoryCluster {
        MemoryCluster::new().with_table(
            TableSchema::new(
                "orders",
                vec![
                    ColumnSchema::key("id", ColumnType::Int64),
                    ColumnSchema::nullable("note", ColumnType::String),
                ],
            )
            .unwrap(),
        )
    }

    fn mutation(id: i64) -> RowMutation {
        RowMutation::new(
            "orders",
            OperationKind::Upsert,
            vec![Cell::new("id", id)],
            RecordRef::new(TopicPartition::new("orders", 0), id as u64),
        )
    }

    fn masters() -> Vec<MasterAddress> {
        MasterAddress::parse_list("m1:7051,m2:7051").unwrap()
    }

    async fn pool(cluster: &MemoryCluster, config: PoolConfig) -> SessionPool {
        SessionPool::connect(config, Arc::new(cluster.connector()))
            .await
            .unwrap()
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(masters())
            .with_max_sessions(3)
            .with_operation_timeout(Duration::from_secs(5))
            .with_socket_read_timeout(Duration::from_secs(2));

        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.session.operation_timeout, Duration::from_secs(5));
        assert_eq!(config.session.socket_read_timeout, Duration::from_secs(2));
        assert!(default_max_sessions() >= 2);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();
        stats.record_created();
        stats.record_apply(100);
        stats.record_apply(200);
        stats.record_failure();
        stats.record_timeout();
        stats.record_closed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sessions_created, 1);
        assert_eq!(snapshot.applies, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.apply_failures, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.sessions_closed, 1);
        assert!((stats.avg_wait_time_ms() - 150.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_apply_writes_row() {
        let cluster = cluster();
        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(2)).await;

        pool.apply(mutation(1)).await.unwrap().await.unwrap();
        assert_eq!(cluster.row_count("orders"), 1);
        assert_eq!(pool.stats().applies, 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_failover_to_second_master() {
        let cluster = cluster();
        cluster.set_unreachable([MasterAddress::new("m1", 7051)]);

        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(1)).await;
        pool.apply(mutation(1)).await.unwrap().await.unwrap();
        assert_eq!(cluster.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_no_master_reachable_is_fatal() {
        let cluster = cluster();
        cluster.set_unreachable(masters());

        let err = SessionPool::connect(PoolConfig::new(masters()), Arc::new(cluster.connector()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::FatalConnection);
        assert!(err.to_string().contains("m2:7051"));
    }

    #[tokio::test]
    async fn test_rejects_empty_config() {
        let cluster = cluster();
        let err = SessionPool::connect(PoolConfig::new(vec![]), Arc::new(cluster.connector()))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = SessionPool::connect(
            PoolConfig::new(masters()).with_max_sessions(0),
            Arc::new(cluster.connector()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_is_transient() {
        let cluster = cluster();
        cluster.set_latency(Duration::from_secs(5));
        let config = PoolConfig::new(masters())
            .with_max_sessions(1)
            .with_operation_timeout(Duration::from_secs(1))
            .with_socket_read_timeout(Duration::from_secs(10));
        let pool = pool(&cluster, config).await;

        let err = pool.apply(mutation(1)).await.unwrap().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("timed out after 1000ms"));
        assert_eq!(pool.stats().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_socket_read_timeout_is_transient() {
        let cluster = cluster();
        cluster.set_latency(Duration::from_secs(5));
        let config = PoolConfig::new(masters())
            .with_max_sessions(1)
            .with_operation_timeout(Duration::from_secs(30))
            .with_socket_read_timeout(Duration::from_secs(2));
        let pool = pool(&cluster, config).await;

        let started = Instant::now();
        let err = pool.apply(mutation(1)).await.unwrap().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("socket read"));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
        assert_eq!(cluster.row_count("orders"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_bounds_concurrency() {
        let cluster = cluster();
        cluster.set_latency(Duration::from_millis(100));
        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(2)).await;

        let mut handles = Vec::new();
        for id in 0..6 {
            handles.push(pool.apply(mutation(id)).await.unwrap());
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cluster.row_count("orders"), 6);
        assert_eq!(cluster.peak_concurrency(), 2);
        assert!(cluster.sessions_opened() <= 2);
        assert!(pool.stats().total_wait_time_ms > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_aborts_call() {
        let cluster = cluster();
        cluster.set_latency(Duration::from_secs(5));
        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(1)).await;

        let handle = pool.apply(mutation(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cluster.row_count("orders"), 0);
        assert!(cluster.attempts().is_empty());
        // the permit came back with the aborted call
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_invalid_session_is_replaced() {
        let cluster = cluster();
        cluster.fail_next(1, Fault::fatal_connection("tablet server lost"));
        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(1)).await;

        let err = pool.apply(mutation(1)).await.unwrap().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::FatalConnection);

        pool.apply(mutation(2)).await.unwrap().await.unwrap();
        assert_eq!(cluster.sessions_opened(), 2);
        assert_eq!(pool.stats().sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_table_schema_cached() {
        let cluster = cluster();
        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(1)).await;

        let first = pool.table_schema("orders").await.unwrap();
        let second = pool.table_schema("orders").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cluster.schema_lookups(), 1);

        let err = pool.table_schema("missing").await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Routing);
    }

    #[tokio::test]
    async fn test_close_rejects_new_calls() {
        let cluster = cluster();
        let pool = pool(&cluster, PoolConfig::new(masters()).with_max_sessions(1)).await;
        pool.close().await;

        assert!(pool.is_closed());
        let err = pool.apply(mutation(1)).await.unwrap_err();
        assert!(err.is_shutdown());
        assert_eq!(pool.stats().sessions_closed, 1);
    }
}
