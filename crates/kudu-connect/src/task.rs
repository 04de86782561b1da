//! Sink task
//!
//! Host-facing driver tying the pipeline together: records handed to
//! [`KuduSinkTask::put`] are routed, translated against the cached table
//! schema, and grouped into per-table batches. Sealed batches run on their own
//! tokio task under the [`RetryController`]; acked batches release their
//! source offsets in the [`OffsetCoordinator`], which the host reads to commit.
//! At most `worker_count` batches are in flight; dispatching past that waits
//! for one to finish, so a slow cluster pushes back on [`KuduSinkTask::put`].
//!
//! Any routing, schema or fatal write error kills the task. The first call
//! observing it returns the error itself, every later call returns
//! [`ConnectError::TaskFailed`].

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::batch::{Batch, WriteBatcher};
use crate::client::ClusterConnector;
use crate::config::{KuduSinkConfig, ResolvedConfig};
use crate::error::{ConnectError, Result};
use crate::mutation::RecordRef;
use crate::offsets::OffsetCoordinator;
use crate::pool::SessionPool;
use crate::record::{Record, TopicPartition};
use crate::retry::{BatchOutcome, RetryController};
use crate::router::{RecordRouter, Route};
use crate::schema::TableSchema;
use crate::stats::{AtomicTaskStats, TaskStats};
use crate::translator::RowTranslator;

/// Summary returned by [`KuduSinkTask::close`]
#[derive(Debug, Clone, Default)]
pub struct ShutdownReport {
    /// Batches that reached a terminal state before the deadline
    pub drained: usize,
    /// Batches cancelled at the deadline; their offsets stay uncommitted
    pub aborted: usize,
    /// Final next-offset-to-consume per partition
    pub commit_offsets: HashMap<TopicPartition, u64>,
    /// Failure that killed the task, if any
    pub failure: Option<String>,
}

/// Kafka-Connect-style sink task writing records into cluster tables
pub struct KuduSinkTask {
    config: ResolvedConfig,
    router: RecordRouter,
    translator: RowTranslator,
    pool: SessionPool,
    batcher: WriteBatcher,
    controller: Arc<RetryController>,
    offsets: Arc<OffsetCoordinator>,
    in_flight: JoinSet<BatchOutcome>,
    cancel: CancellationToken,
    stats: Arc<AtomicTaskStats>,
    failure: Option<String>,
}

impl KuduSinkTask {
    /// Resolve the configuration and connect to the master quorum
    pub async fn start(
        config: &KuduSinkConfig,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        Self::with_resolved(config.resolve()?, connector).await
    }

    /// Start from already resolved settings
    pub async fn with_resolved(
        config: ResolvedConfig,
        connector: Arc<dyn ClusterConnector>,
    ) -> Result<Self> {
        let pool = SessionPool::connect(config.pool_config(), connector).await?;

        info!(
            masters = config.masters.len(),
            workers = config.worker_count,
            table_field = config.routing.table_field.as_deref().unwrap_or("<topic>"),
            operation = %config.operation,
            max_retries = config.retry.max_retries,
            retry_backoff_ms = u64::try_from(config.retry.backoff.as_millis()).unwrap_or(u64::MAX),
            "Kudu sink task started"
        );

        Ok(Self {
            router: RecordRouter::new(config.routing.clone()),
            translator: RowTranslator::new(config.key_insert, config.operation)
                .with_table_field(config.routing.table_field.clone()),
            batcher: WriteBatcher::new(config.batch),
            controller: Arc::new(RetryController::new(config.retry)),
            offsets: Arc::new(OffsetCoordinator::new()),
            in_flight: JoinSet::new(),
            cancel: CancellationToken::new(),
            stats: Arc::new(AtomicTaskStats::default()),
            failure: None,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Route, translate and batch one poll's worth of records. Full batches
    /// and batches whose linger elapsed are dispatched before returning.
    pub async fn put(&mut self, records: Vec<Record>) -> Result<()> {
        self.reap()?;
        self.stats.record_received(records.len() as u64);

        for record in records {
            if let Err(e) = self.process(record).await {
                self.stats.record_failed();
                return Err(self.fail(e));
            }
        }

        self.dispatch_expired().await
    }

    /// Dispatch batches whose linger elapsed and fold in finished batches
    pub async fn tick(&mut self) -> Result<()> {
        self.reap()?;
        self.dispatch_expired().await
    }

    /// When the oldest open batch is due, for hosts scheduling [`Self::tick`]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.batcher.next_deadline()
    }

    /// Dispatch every open batch and wait for all in-flight batches.
    /// Returns the offsets that are now safe to commit.
    pub async fn flush(&mut self) -> Result<HashMap<TopicPartition, u64>> {
        self.reap()?;
        for batch in self.batcher.drain_all() {
            self.dispatch(batch).await?;
        }

        while let Some(joined) = self.in_flight.join_next().await {
            self.settle(joined)?;
        }

        let offsets = self.offsets.commit_offsets();
        debug!(partitions = offsets.len(), "Flushed sink task");
        Ok(offsets)
    }

    /// Inclusive watermark per partition
    pub fn watermarks(&self) -> HashMap<TopicPartition, u64> {
        self.offsets.watermarks()
    }

    /// Next offset to consume per partition
    pub fn commit_offsets(&self) -> HashMap<TopicPartition, u64> {
        self.offsets.commit_offsets()
    }

    /// Shared handle for readers outside the task
    pub fn offsets(&self) -> Arc<OffsetCoordinator> {
        Arc::clone(&self.offsets)
    }

    pub fn stats(&self) -> TaskStats {
        self.stats.snapshot(self.pool.stats())
    }

    /// Batches dispatched and not yet folded in
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Drain open and in-flight batches within the shutdown deadline, abort
    /// whatever is left, and close the pool.
    pub async fn close(mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        // the drain deadline bounds shutdown, so open batches skip the cap
        for batch in self.batcher.drain_all() {
            self.spawn(batch);
        }
        info!(
            in_flight = self.in_flight.len(),
            timeout_ms = u64::try_from(self.config.shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
            "Closing sink task"
        );

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.in_flight.join_next()).await {
                Ok(Some(joined)) => match self.settle(joined) {
                    Ok(true) => report.aborted += 1,
                    Ok(false) | Err(_) => report.drained += 1,
                },
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = self.in_flight.len(),
                        "Shutdown deadline reached, aborting in-flight batches"
                    );
                    break;
                }
            }
        }

        // aborted batches never ack, so their offsets stay behind the watermark
        self.cancel.cancel();
        while let Some(joined) = self.in_flight.join_next().await {
            match self.settle(joined) {
                Ok(true) => report.aborted += 1,
                Ok(false) | Err(_) => report.drained += 1,
            }
        }

        self.pool.close().await;

        report.commit_offsets = self.offsets.commit_offsets();
        report.failure = self.failure.take();
        info!(
            drained = report.drained,
            aborted = report.aborted,
            partitions = report.commit_offsets.len(),
            failed = report.failure.is_some(),
            "Sink task closed"
        );
        report
    }

    async fn process(&mut self, record: Record) -> Result<()> {
        let source = RecordRef::from(&record);

        let target = match self.router.route(&record)? {
            Route::Table(target) => target,
            Route::Excluded(target) => {
                trace!(record = %source, table = %target, "Record excluded by table filter");
                self.stats.record_excluded();
                self.offsets.track(&source, 0);
                return Ok(());
            }
        };

        let schema = self.table_schema(target.name()).await?;
        let mutation = self.translator.translate(&record, &target, &schema)?;

        self.offsets.track(&source, 1);
        if let Some(batch) = self.batcher.push(mutation) {
            self.dispatch(batch).await?;
        }
        Ok(())
    }

    /// Schema lookup retrying transient failures with the batch backoff
    async fn table_schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        let policy = *self.controller.policy();
        let mut attempt = 0;
        loop {
            match self.pool.table_schema(table).await {
                Ok(schema) => return Ok(schema),
                Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                    attempt += 1;
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        table = %table,
                        attempt,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Schema lookup failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retriable() => {
                    return Err(ConnectError::RetriesExhausted {
                        table: table.to_string(),
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch_expired(&mut self) -> Result<()> {
        for batch in self.batcher.drain_expired(Instant::now()) {
            self.dispatch(batch).await?;
        }
        Ok(())
    }

    /// Spawn a batch once an in-flight slot is free
    async fn dispatch(&mut self, batch: Batch) -> Result<()> {
        while self.in_flight.len() >= self.config.worker_count {
            trace!(in_flight = self.in_flight.len(), "In-flight limit reached, waiting");
            match self.in_flight.join_next().await {
                Some(joined) => {
                    self.settle(joined)?;
                }
                None => break,
            }
        }
        self.spawn(batch);
        Ok(())
    }

    fn spawn(&mut self, batch: Batch) {
        let controller = Arc::clone(&self.controller);
        let offsets = Arc::clone(&self.offsets);
        let pool = self.pool.clone();
        let cancel = self.cancel.clone();

        debug!(batch = %batch.id(), table = %batch.table(), rows = batch.len(), "Dispatching batch");
        self.in_flight.spawn(async move {
            let outcome = controller.drive(batch, &pool, &cancel).await;
            if outcome.is_acked() {
                offsets.ack(&outcome.origins);
            }
            outcome
        });
    }

    /// Fold in every batch that already finished
    fn reap(&mut self) -> Result<()> {
        self.ensure_running()?;
        while let Some(joined) = self.in_flight.try_join_next() {
            self.settle(joined)?;
        }
        Ok(())
    }

    /// Record a finished batch. Returns whether it was aborted, or the error
    /// that failed the task.
    fn settle(&mut self, joined: std::result::Result<BatchOutcome, JoinError>) -> Result<bool> {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => {
                self.stats.record_aborted();
                return Ok(true);
            }
            Err(e) => {
                return Err(self.fail(ConnectError::Internal(format!("batch task panicked: {}", e))))
            }
        };

        self.stats.record_outcome(&outcome);
        let aborted = outcome.is_aborted();
        match outcome.error {
            Some(error) if !error.is_shutdown() => Err(self.fail(error)),
            _ => Ok(aborted),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        match &self.failure {
            Some(message) => Err(ConnectError::TaskFailed(message.clone())),
            None => Ok(()),
        }
    }

    fn fail(&mut self, error: ConnectError) -> ConnectError {
        if self.failure.is_none() {
            error!(category = %error.category(), error = %error, "Sink task failed");
            self.failure = Some(error.to_string());
        }
        error
    }
}

impl std::fmt::Debug for KuduSinkTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KuduSinkTask")
            .field("pool", &self.pool)
            .field("open_rows", &self.batcher.pending_rows())
            .field("in_flight", &self.in_flight.len())
            .field("failure", &self.failure)
            .finish()
    }
}
