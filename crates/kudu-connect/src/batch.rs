//! Write batching
//!
//! Mutations are grouped per table into batches sealed by size or age. A
//! sealed [`Batch`] carries its own lifecycle:
//!
//! ```text
//! PENDING -> IN_FLIGHT -> ACKED
//!                      -> PARTIAL_FAILURE -> PENDING (failed rows only)
//!                                         -> FATAL_FAILURE
//! ```

use futures::future::join_all;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ConnectError, Result};
use crate::mutation::{RecordRef, RowMutation};
use crate::pool::SessionPool;

/// Outcome of one mutation, positionally matching the batch
pub type RowResult = Result<()>;

/// Batch identifier, stable across retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl BatchId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch-{}", self.0)
    }
}

/// Batch lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    Pending,
    InFlight,
    Acked,
    PartialFailure,
    FatalFailure,
}

impl BatchState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::FatalFailure)
    }
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::InFlight => "IN_FLIGHT",
            Self::Acked => "ACKED",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::FatalFailure => "FATAL_FAILURE",
        };
        write!(f, "{}", name)
    }
}

/// Ordered mutations for one table plus their retry state
#[derive(Debug)]
pub struct Batch {
    id: BatchId,
    table: String,
    mutations: Vec<RowMutation>,
    state: BatchState,
    attempt: u32,
    last_error: Option<ConnectError>,
    next_retry_at: Option<Instant>,
    /// Every record that contributed to the original batch
    origins: Vec<RecordRef>,
    rows_written: usize,
    dropped: Vec<RecordRef>,
}

impl Batch {
    pub fn new(id: BatchId, table: impl Into<String>, mutations: Vec<RowMutation>) -> Self {
        let origins = mutations.iter().map(|m| m.source().clone()).collect();
        Self {
            id,
            table: table.into(),
            mutations,
            state: BatchState::Pending,
            attempt: 0,
            last_error: None,
            next_retry_at: None,
            origins,
            rows_written: 0,
            dropped: Vec::new(),
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Mutations still to be written, in arrival order
    pub fn mutations(&self) -> &[RowMutation] {
        &self.mutations
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Submissions so far, including the first
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Resubmissions so far
    pub fn retries(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    pub fn last_error(&self) -> Option<&ConnectError> {
        self.last_error.as_ref()
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn origins(&self) -> &[RecordRef] {
        &self.origins
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    /// Rows dropped under the skip policy
    pub fn dropped(&self) -> &[RecordRef] {
        &self.dropped
    }

    pub(crate) fn begin_attempt(&mut self) {
        debug_assert_eq!(self.state, BatchState::Pending);
        self.state = BatchState::InFlight;
        self.attempt += 1;
        self.next_retry_at = None;
    }

    pub(crate) fn set_state(&mut self, state: BatchState) {
        self.state = state;
    }

    pub(crate) fn record_written(&mut self, rows: usize) {
        self.rows_written += rows;
    }

    pub(crate) fn record_dropped(&mut self, source: RecordRef) {
        self.dropped.push(source);
    }

    /// New pending batch holding clones of the mutations at `failed`
    pub(crate) fn rebuild(
        self,
        failed: &[usize],
        error: ConnectError,
        next_retry_at: Instant,
    ) -> Batch {
        let mutations = failed
            .iter()
            .filter_map(|&i| self.mutations.get(i).cloned())
            .collect();
        Batch {
            id: self.id,
            table: self.table,
            mutations,
            state: BatchState::Pending,
            attempt: self.attempt,
            last_error: Some(error),
            next_retry_at: Some(next_retry_at),
            origins: self.origins,
            rows_written: self.rows_written,
            dropped: self.dropped,
        }
    }
}

/// Batch thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    /// Seal a batch once it holds this many rows
    pub max_rows: usize,
    /// Seal a batch once its first row is this old
    pub linger: Duration,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_rows: 1000,
            linger: Duration::from_millis(1000),
        }
    }
}

impl BatchSettings {
    pub fn with_max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows.max(1);
        self
    }

    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

#[derive(Debug)]
struct OpenBatch {
    mutations: Vec<RowMutation>,
    opened_at: Instant,
    seq: u64,
}

/// Accumulates mutations into per-table batches
#[derive(Debug, Default)]
pub struct WriteBatcher {
    settings: BatchSettings,
    open: HashMap<String, OpenBatch>,
    next_id: u64,
    next_seq: u64,
}

impl WriteBatcher {
    pub fn new(settings: BatchSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Add a mutation; returns its batch if this filled it
    pub fn push(&mut self, mutation: RowMutation) -> Option<Batch> {
        let table = mutation.table().to_string();
        let open = match self.open.entry(table.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                self.next_seq += 1;
                entry.insert(OpenBatch {
                    mutations: Vec::new(),
                    opened_at: Instant::now(),
                    seq: self.next_seq,
                })
            }
        };
        open.mutations.push(mutation);

        if open.mutations.len() >= self.settings.max_rows {
            let open = self.open.remove(&table)?;
            return Some(self.seal(table, open));
        }
        None
    }

    /// Seal batches whose linger elapsed at `now`
    pub fn drain_expired(&mut self, now: Instant) -> Vec<Batch> {
        let linger = self.settings.linger;
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, open)| now.saturating_duration_since(open.opened_at) >= linger)
            .map(|(table, _)| table.clone())
            .collect();
        self.take(expired)
    }

    /// Seal every open batch, oldest first
    pub fn drain_all(&mut self) -> Vec<Batch> {
        let tables: Vec<String> = self.open.keys().cloned().collect();
        self.take(tables)
    }

    /// When the oldest open batch will expire
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .map(|open| open.opened_at + self.settings.linger)
            .min()
    }

    /// Rows waiting in open batches
    pub fn pending_rows(&self) -> usize {
        self.open.values().map(|open| open.mutations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    fn take(&mut self, tables: Vec<String>) -> Vec<Batch> {
        let mut sealed: Vec<(String, OpenBatch)> = tables
            .into_iter()
            .filter_map(|table| self.open.remove_entry(&table))
            .collect();
        sealed.sort_by_key(|(_, open)| open.seq);
        sealed
            .into_iter()
            .map(|(table, open)| self.seal(table, open))
            .collect()
    }

    fn seal(&mut self, table: String, open: OpenBatch) -> Batch {
        self.next_id += 1;
        let batch = Batch::new(BatchId::new(self.next_id), table, open.mutations);
        debug!(batch = %batch.id(), table = %batch.table(), rows = batch.len(), "Sealed batch");
        batch
    }

    /// Submit every mutation of `batch` through the pool, one apply per
    /// mutation, and collect the per-row results in batch order. Leaves the
    /// batch `ACKED` or `PARTIAL_FAILURE`.
    pub async fn submit(pool: &SessionPool, batch: &mut Batch) -> Vec<RowResult> {
        batch.begin_attempt();
        debug!(
            batch = %batch.id(),
            table = %batch.table(),
            rows = batch.len(),
            attempt = batch.attempt(),
            "Submitting batch"
        );

        let mut dispatched = Vec::with_capacity(batch.len());
        for mutation in batch.mutations() {
            dispatched.push(pool.apply(mutation.clone()).await);
        }

        let results = join_all(dispatched.into_iter().map(|d| async move {
            match d {
                Ok(handle) => handle.await,
                Err(e) => Err(e),
            }
        }))
        .await;

        let state = if results.iter().all(|r| r.is_ok()) {
            BatchState::Acked
        } else {
            BatchState::PartialFailure
        };
        batch.set_state(state);
        results
    }
}
