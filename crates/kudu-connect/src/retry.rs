//! Batch retry state machine
//!
//! [`RetryController::classify`] decides, from a submitted batch and its
//! per-row results, whether the batch is done, must be retried with only its
//! transiently failed rows, or has failed for good. [`RetryController::drive`]
//! runs that decision in a loop with fixed backoff between attempts.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, BatchId, BatchState, RowResult, WriteBatcher};
use crate::error::{ConnectError, ErrorCategory};
use crate::mutation::RecordRef;
use crate::pool::SessionPool;

/// What to do with a row the cluster rejects permanently
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum RowErrorPolicy {
    /// Fail the batch and the task; nothing past the row is committed
    #[default]
    Fail,
    /// Log and drop the row; its offset is released with the batch
    Skip,
}

impl fmt::Display for RowErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Skip => write!(f, "skip"),
        }
    }
}

/// Retry behavior for batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of resubmissions (not including the initial attempt)
    pub max_retries: u32,
    /// Fixed delay before each resubmission
    pub backoff: Duration,
    pub row_error_policy: RowErrorPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff: Duration::from_millis(3000),
            row_error_policy: RowErrorPolicy::Fail,
        }
    }
}

impl RetryPolicy {
    /// Fixed delay between retries
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            ..Default::default()
        }
    }

    /// Fail on the first transient error
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_row_error_policy(mut self, policy: RowErrorPolicy) -> Self {
        self.row_error_policy = policy;
        self
    }

    /// Delay before a given attempt (0-indexed); the first attempt is immediate
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.backoff
        }
    }
}

/// Next step for a submitted batch
#[derive(Debug)]
pub enum Transition {
    /// Every remaining row was written (or dropped under the skip policy)
    Acked(Batch),
    /// Resubmit `batch`, holding only the transiently failed rows, after `delay`
    Retry { batch: Batch, delay: Duration },
    /// The batch failed for good; the task must fail
    Fatal { batch: Batch, error: ConnectError },
    /// The pool shut down under the batch
    Aborted(Batch),
}

/// Final report of a driven batch
#[derive(Debug)]
pub struct BatchOutcome {
    pub id: BatchId,
    pub table: String,
    pub state: BatchState,
    pub attempts: u32,
    /// Records released when the batch is acked
    pub origins: Vec<RecordRef>,
    pub rows_written: usize,
    pub dropped: Vec<RecordRef>,
    /// Fatal cause, or `Shutdown` when aborted
    pub error: Option<ConnectError>,
}

impl BatchOutcome {
    fn new(batch: Batch, error: Option<ConnectError>) -> Self {
        Self {
            id: batch.id(),
            table: batch.table().to_string(),
            state: batch.state(),
            attempts: batch.attempt(),
            rows_written: batch.rows_written(),
            dropped: batch.dropped().to_vec(),
            origins: batch.origins().to_vec(),
            error,
        }
    }

    fn aborted(batch: Batch) -> Self {
        Self::new(batch, Some(ConnectError::Shutdown))
    }

    pub fn is_acked(&self) -> bool {
        self.state == BatchState::Acked
    }

    pub fn is_aborted(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.is_shutdown())
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Owns batches from submission to a terminal state
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide the next step for a batch from its positional row results.
    ///
    /// A lost connection fails the batch at once, as does any error that is
    /// neither transient nor a row rejection. A rejected row fails the batch
    /// under the `fail` policy and is dropped under `skip`. Transient
    /// errors are retried until `max_retries` resubmissions were spent.
    pub fn classify(&self, mut batch: Batch, results: Vec<RowResult>) -> Transition {
        debug_assert_eq!(batch.len(), results.len());

        let mut written = 0;
        let mut transient = Vec::new();
        let mut last_transient = None;
        let mut permanent = None;
        let mut fatal = None;
        let mut aborted = false;

        for (index, result) in results.into_iter().enumerate() {
            let error = match result {
                Ok(()) => {
                    written += 1;
                    continue;
                }
                Err(e) => e,
            };

            match error.category() {
                ErrorCategory::Transient => {
                    transient.push(index);
                    last_transient = Some(error);
                }
                ErrorCategory::Shutdown => aborted = true,
                ErrorCategory::NonRetryable => match self.policy.row_error_policy {
                    RowErrorPolicy::Fail => {
                        permanent.get_or_insert(error);
                    }
                    RowErrorPolicy::Skip => {
                        let source = batch.mutations()[index].source().clone();
                        warn!(
                            batch = %batch.id(),
                            table = %batch.table(),
                            record = %source,
                            error = %error,
                            "Dropping rejected row"
                        );
                        batch.record_dropped(source);
                    }
                },
                // lost connection, or an error no row policy covers
                _ => {
                    fatal.get_or_insert(error);
                }
            }
        }
        batch.record_written(written);

        if let Some(error) = fatal.or(permanent) {
            batch.set_state(BatchState::FatalFailure);
            return Transition::Fatal { batch, error };
        }
        if aborted {
            return Transition::Aborted(batch);
        }

        let Some(error) = last_transient else {
            batch.set_state(BatchState::Acked);
            return Transition::Acked(batch);
        };

        batch.set_state(BatchState::PartialFailure);
        if batch.retries() >= self.policy.max_retries {
            let error = ConnectError::RetriesExhausted {
                table: batch.table().to_string(),
                attempts: batch.attempt(),
                last_error: error.to_string(),
            };
            batch.set_state(BatchState::FatalFailure);
            return Transition::Fatal { batch, error };
        }

        let delay = self.policy.delay_for_attempt(batch.attempt());
        let batch = batch.rebuild(&transient, error, Instant::now() + delay);
        Transition::Retry { batch, delay }
    }

    /// Submit a batch and keep resubmitting its failed rows until it reaches
    /// a terminal state or `cancel` fires. Backoff waits hold no pool permit.
    pub async fn drive(
        &self,
        mut batch: Batch,
        pool: &SessionPool,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        loop {
            let submitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                results = WriteBatcher::submit(pool, &mut batch) => Some(results),
            };
            let Some(results) = submitted else {
                debug!(batch = %batch.id(), table = %batch.table(), "Batch aborted in flight");
                return BatchOutcome::aborted(batch);
            };

            match self.classify(batch, results) {
                Transition::Acked(done) => {
                    info!(
                        batch = %done.id(),
                        table = %done.table(),
                        rows = done.rows_written(),
                        dropped = done.dropped().len(),
                        attempts = done.attempt(),
                        "Batch acked"
                    );
                    return BatchOutcome::new(done, None);
                }
                Transition::Fatal { batch: failed, error } => {
                    error!(
                        batch = %failed.id(),
                        table = %failed.table(),
                        attempts = failed.attempt(),
                        error = %error,
                        "Batch failed"
                    );
                    return BatchOutcome::new(failed, Some(error));
                }
                Transition::Aborted(stopped) => {
                    debug!(batch = %stopped.id(), table = %stopped.table(), "Batch aborted by pool shutdown");
                    return BatchOutcome::aborted(stopped);
                }
                Transition::Retry { batch: next, delay } => {
                    warn!(
                        batch = %next.id(),
                        table = %next.table(),
                        failed = next.len(),
                        attempt = next.attempt(),
                        max_retries = self.policy.max_retries,
                        retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %next.last_error().map(ToString::to_string).unwrap_or_default(),
                        "Batch partially failed, retrying"
                    );

                    let cancelled = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if cancelled {
                        return BatchOutcome::aborted(next);
                    }
                    batch = next;
                }
            }
        }
    }
}
