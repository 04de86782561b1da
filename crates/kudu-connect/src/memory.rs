//! In-memory cluster
//!
//! Implements the client seam against process-local tables. Used by the
//! `replay` command and by tests, with hooks to inject the failures a real
//! cluster produces: unreachable masters, transient and permanent row errors,
//! lost connections and slow responses.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::client::{ClusterConnector, MasterAddress, Session, SessionOptions};
use crate::error::{ConnectError, Result};
use crate::mutation::{Cell, OperationKind, RecordRef, RowMutation};
use crate::schema::TableSchema;

/// Failure returned by an apply call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Transient(String),
    NonRetryable(String),
    /// Also invalidates the session
    FatalConnection(String),
    /// Respond this much later than usual, then apply normally
    Delay(Duration),
}

impl Fault {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self::NonRetryable(message.into())
    }

    pub fn fatal_connection(message: impl Into<String>) -> Self {
        Self::FatalConnection(message.into())
    }
}

type FaultRule = Box<dyn Fn(&RowMutation, u32) -> Option<Fault> + Send + Sync>;

/// One apply call as seen by the cluster
#[derive(Debug, Clone)]
pub struct ApplyAttempt {
    pub table: String,
    pub source: RecordRef,
    pub started_at: Instant,
    pub succeeded: bool,
}

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<String, Vec<Cell>>,
}

#[derive(Default)]
struct ClusterState {
    tables: Mutex<HashMap<String, MemoryTable>>,
    unreachable: Mutex<HashSet<MasterAddress>>,
    queued_faults: Mutex<VecDeque<Fault>>,
    rules: Mutex<Vec<FaultRule>>,
    latency: Mutex<Duration>,
    attempts: Mutex<Vec<ApplyAttempt>>,
    seen: Mutex<HashMap<RecordRef, u32>>,
    sessions_opened: AtomicUsize,
    schema_lookups: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Process-local cluster. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, schema: TableSchema) -> Self {
        self.create_table(schema);
        self
    }

    /// Create a table, replacing any existing table of the same name
    pub fn create_table(&self, schema: TableSchema) {
        self.state.tables.lock().insert(
            schema.name().to_string(),
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            cluster: self.clone(),
        }
    }

    /// Masters that refuse sessions; replaces the previous set
    pub fn set_unreachable(&self, masters: impl IntoIterator<Item = MasterAddress>) {
        *self.state.unreachable.lock() = masters.into_iter().collect();
    }

    /// Response time of every apply call
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Fail the next `count` apply calls, whatever their table
    pub fn fail_next(&self, count: usize, fault: Fault) {
        let mut queue = self.state.queued_faults.lock();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Consult `rule` on every apply call. It receives the mutation and how
    /// many times a mutation from the same source record has been applied,
    /// counting this call (1 on first sight).
    pub fn add_fault_rule<F>(&self, rule: F)
    where
        F: Fn(&RowMutation, u32) -> Option<Fault> + Send + Sync + 'static,
    {
        self.state.rules.lock().push(Box::new(rule));
    }

    pub fn clear_faults(&self) {
        self.state.queued_faults.lock().clear();
        self.state.rules.lock().clear();
    }

    /// Rows of a table in key order
    pub fn rows(&self, table: &str) -> Vec<Vec<Cell>> {
        self.state
            .tables
            .lock()
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .tables
            .lock()
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.tables.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every apply call, in the order they started
    pub fn attempts(&self) -> Vec<ApplyAttempt> {
        self.state.attempts.lock().clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::Relaxed)
    }

    pub fn schema_lookups(&self) -> usize {
        self.state.schema_lookups.load(Ordering::Relaxed)
    }

    /// Highest number of apply calls observed running at once
    pub fn peak_concurrency(&self) -> usize {
        self.state.peak_in_flight.load(Ordering::Relaxed)
    }

    fn next_fault(&self, mutation: &RowMutation) -> Option<Fault> {
        let seen = {
            let mut seen = self.state.seen.lock();
            let count = seen.entry(mutation.source().clone()).or_insert(0);
            *count += 1;
            *count
        };

        if let Some(fault) = self.state.queued_faults.lock().pop_front() {
            return Some(fault);
        }
        self.state
            .rules
            .lock()
            .iter()
            .find_map(|rule| rule(mutation, seen))
    }

    fn write(&self, mutation: &RowMutation) -> Result<()> {
        let mut tables = self.state.tables.lock();
        let table = tables.get_mut(mutation.table()).ok_or_else(|| {
            ConnectError::non_retryable(format!("table '{}' does not exist", mutation.table()))
        })?;

        for cell in mutation.cells() {
            let column = table.schema.column(&cell.column).ok_or_else(|| {
                ConnectError::non_retryable(format!("unknown column '{}'", cell.column))
            })?;
            if cell.value.is_null() && !column.nullable {
                return Err(ConnectError::non_retryable(format!(
                    "column '{}' is not nullable",
                    cell.column
                )));
            }
            if let Some(t) = cell.value.field_type() {
                if !column.column_type.accepts(t) {
                    return Err(ConnectError::non_retryable(format!(
                        "column '{}' cannot hold {}",
                        cell.column, t
                    )));
                }
            }
        }

        let mut key = Vec::new();
        for column in table.schema.key_columns() {
            let value = mutation.get(&column.name).ok_or_else(|| {
                ConnectError::non_retryable(format!("missing key column '{}'", column.name))
            })?;
            key.push(value.to_string());
        }
        let key = key.join("\u{1f}");

        match mutation.operation() {
            OperationKind::Insert if table.rows.contains_key(&key) => Err(
                ConnectError::non_retryable(format!("key already present in '{}'", mutation.table())),
            ),
            _ => {
                table.rows.insert(key, mutation.cells().to_vec());
                Ok(())
            }
        }
    }
}

/// [`ClusterConnector`] over a [`MemoryCluster`]
#[derive(Clone)]
pub struct MemoryConnector {
    cluster: MemoryCluster,
}

#[async_trait]
impl ClusterConnector for MemoryConnector {
    async fn connect(
        &self,
        master: &MasterAddress,
        options: &SessionOptions,
    ) -> Result<Box<dyn Session>> {
        if self.cluster.state.unreachable.lock().contains(master) {
            return Err(ConnectError::transient(format!(
                "master {} is unreachable",
                master
            )));
        }
        self.cluster
            .state
            .sessions_opened
            .fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            cluster: self.cluster.clone(),
            options: *options,
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemorySession {
    cluster: MemoryCluster,
    options: SessionOptions,
    broken: AtomicBool,
    closed: AtomicBool,
}

struct InFlightGuard<'a>(&'a ClusterState);

impl<'a> InFlightGuard<'a> {
    fn enter(state: &'a ClusterState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemorySession {
    async fn respond(&self, mutation: &RowMutation) -> Result<()> {
        let mut latency = *self.cluster.state.latency.lock();
        match self.cluster.next_fault(mutation) {
            Some(Fault::Transient(message)) => return Err(ConnectError::transient(message)),
            Some(Fault::NonRetryable(message)) => return Err(ConnectError::non_retryable(message)),
            Some(Fault::FatalConnection(message)) => {
                self.broken.store(true, Ordering::Release);
                return Err(ConnectError::fatal_connection(message));
            }
            Some(Fault::Delay(extra)) => latency += extra,
            None => {}
        }

        if latency > self.options.socket_read_timeout {
            tokio::time::sleep(self.options.socket_read_timeout).await;
            return Err(ConnectError::transient(format!(
                "socket read timed out after {}ms",
                self.options.socket_read_timeout.as_millis()
            )));
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.cluster.write(mutation)
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn table_schema(&self, table: &str) -> Result<TableSchema> {
        self.cluster
            .state
            .schema_lookups
            .fetch_add(1, Ordering::Relaxed);
        self.cluster
            .state
            .tables
            .lock()
            .get(table)
            .map(|t| t.schema.clone())
            .ok_or_else(|| ConnectError::routing(format!("table '{}' does not exist", table)))
    }

    async fn apply(&self, mutation: &RowMutation) -> Result<()> {
        if self.closed.load(Ordering::Acquire) || self.broken.load(Ordering::Acquire) {
            return Err(ConnectError::transient("session is closed"));
        }

        let started_at = Instant::now();
        let result = {
            let _guard = InFlightGuard::enter(&self.cluster.state);
            self.respond(mutation).await
        };

        debug!(
            table = %mutation.table(),
            source = %mutation.source(),
            ok = result.is_ok(),
            "Memory cluster apply"
        );
        self.cluster.state.attempts.lock().push(ApplyAttempt {
            table: mutation.table().to_string(),
            source: mutation.source().clone(),
            started_at,
            succeeded: result.is_ok(),
        });
        result
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.broken.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
