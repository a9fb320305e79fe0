//! Secondary-side replay poller.
//!
//! One [`ReplayPoller::poll_once`] cycle:
//!
//! 1. Read up to `max_batch` envelopes through the read-batch port. A non-zero
//!    status or a payload that is not a JSON array fails the whole cycle before
//!    any envelope is touched. A single malformed element is counted as failed
//!    and the rest of the batch goes ahead.
//! 2. For each envelope, in order, inside its own secondary transaction:
//!    skip it if the ledger already holds its id, otherwise dispatch it to its
//!    adapter and record the id in the ledger.
//! 3. A failing envelope is rolled back, logged and counted; the cycle moves on to
//!    the next one. It stays unmarked and is retried on a later delivery.
//!
//! The poller holds no timer; see [`crate::scheduler`] for the fixed-delay loop.

use crate::config::ReadConfig;
use crate::logging::ParamMasker;
use crate::metrics::ReplayMetrics;
use replay_outbox_core::environment::{Clock, SystemClock};
use replay_outbox_core::ports::{MarkOutcome, ProcessedLedger, ReadBatch};
use replay_outbox_core::{
    AdapterRegistry, ConnectionOf, Envelope, ManagedTransaction, OutboxError, Transaction,
    TransactionManager,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::Instrument;

/// Status reported for a read-batch call that could not be made at all.
pub const TRANSPORT_ERROR_STATUS: i32 = -1;

/// Counts of one poll cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Envelopes returned by the read call.
    pub received: usize,
    /// Envelopes applied and marked processed.
    pub applied: usize,
    /// Envelopes already processed.
    pub skipped: usize,
    /// Envelopes whose application failed.
    pub failed: usize,
}

impl fmt::Display for PollReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "received={} applied={} skipped={} failed={}",
            self.received, self.applied, self.skipped, self.failed
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ItemOutcome {
    Applied,
    Skipped,
}

/// Applies replayed envelopes to the secondary store exactly once in effect.
pub struct ReplayPoller<M: TransactionManager> {
    manager: M,
    reader: Arc<dyn ReadBatch<ConnectionOf<M>>>,
    ledger: Arc<dyn ProcessedLedger<ConnectionOf<M>>>,
    registry: Arc<AdapterRegistry<ConnectionOf<M>>>,
    clock: Arc<dyn Clock>,
    max_batch: u32,
    masker: ParamMasker,
    cycle: Mutex<()>,
}

impl<M: TransactionManager> ReplayPoller<M> {
    /// Poller reading batches of 50 with the system clock.
    #[must_use]
    pub fn new(
        manager: M,
        reader: Arc<dyn ReadBatch<ConnectionOf<M>>>,
        ledger: Arc<dyn ProcessedLedger<ConnectionOf<M>>>,
        registry: Arc<AdapterRegistry<ConnectionOf<M>>>,
    ) -> Self {
        Self {
            manager,
            reader,
            ledger,
            registry,
            clock: Arc::new(SystemClock),
            max_batch: ReadConfig::default().batch_size,
            masker: ParamMasker::default(),
            cycle: Mutex::new(()),
        }
    }

    /// Read at most `max_batch` envelopes per cycle.
    #[must_use]
    pub const fn with_max_batch(mut self, max_batch: u32) -> Self {
        self.max_batch = max_batch;
        self
    }

    /// Use `clock` for ledger timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Mask params in log output.
    #[must_use]
    pub fn with_masker(mut self, masker: ParamMasker) -> Self {
        self.masker = masker;
        self
    }

    /// Configured batch size.
    #[must_use]
    pub const fn max_batch(&self) -> u32 {
        self.max_batch
    }

    /// Run one poll cycle.
    ///
    /// Concurrent calls on the same poller run one after the other.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::BatchReadFailure`] if the read call reported a non-zero
    ///   status or could not be made.
    /// - [`OutboxError::EnvelopeParse`] if the payload is not a JSON array.
    /// - [`OutboxError::Store`] if the read transaction could not be opened or
    ///   committed.
    ///
    /// Per-envelope failures, malformed elements included, never fail the cycle;
    /// they show up in [`PollReport::failed`].
    pub async fn poll_once(&self) -> Result<PollReport, OutboxError> {
        let _cycle = self.cycle.lock().await;
        let span = tracing::info_span!("replay_poll", max_batch = self.max_batch);

        async move {
            let started = Instant::now();
            let items = match self.read_batch().await {
                Ok(items) => items,
                Err(error) => {
                    ReplayMetrics::record_batch_failure();
                    tracing::warn!(error = %error, "Batch read failed, skipping cycle");
                    return Err(error);
                }
            };

            let mut report = PollReport {
                received: items.len(),
                ..PollReport::default()
            };
            for (position, item) in items.iter().enumerate() {
                let envelope = match item {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        report.failed += 1;
                        tracing::error!(
                            position,
                            error = %error,
                            "Skipping malformed envelope"
                        );
                        continue;
                    }
                };
                match self.apply(envelope).await {
                    Ok(ItemOutcome::Applied) => report.applied += 1,
                    Ok(ItemOutcome::Skipped) => report.skipped += 1,
                    Err(error) => {
                        report.failed += 1;
                        tracing::error!(
                            message_id = %envelope.message_id(),
                            operation_class = envelope.operation_class(),
                            operation_name = envelope.operation_name(),
                            params = %self.masker.display(envelope.params()),
                            error = %error,
                            "Failed to apply envelope, leaving it for redelivery"
                        );
                    }
                }
            }

            ReplayMetrics::record_cycle(
                report.received,
                report.applied,
                report.skipped,
                report.failed,
                started.elapsed(),
            );
            if report.received > 0 {
                tracing::info!(%report, "Poll cycle finished");
            } else {
                tracing::debug!("Poll cycle found nothing to replay");
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn read_batch(&self) -> Result<Vec<Result<Envelope, OutboxError>>, OutboxError> {
        let mut tx = ManagedTransaction::begin(&self.manager).await?;
        let read = self.reader.read_batch(tx.connection()?, self.max_batch).await;

        let result = match read {
            Ok(result) if result.is_ok() => result,
            Ok(result) => {
                discard(tx).await;
                return Err(OutboxError::BatchReadFailure {
                    status: result.status,
                    message: result
                        .error_message
                        .unwrap_or_else(|| "no error message".to_string()),
                });
            }
            Err(error) => {
                discard(tx).await;
                return Err(OutboxError::BatchReadFailure {
                    status: TRANSPORT_ERROR_STATUS,
                    message: format!("transport error: {error}"),
                });
            }
        };

        match Envelope::parse_batch_items(result.envelopes_json.as_deref()) {
            Ok(items) => {
                tx.commit().await?;
                Ok(items)
            }
            Err(error) => {
                discard(tx).await;
                Err(error)
            }
        }
    }

    async fn apply(&self, envelope: &Envelope) -> Result<ItemOutcome, OutboxError> {
        let span = tracing::info_span!(
            "replay_item",
            message_id = %envelope.message_id(),
            operation_class = envelope.operation_class(),
            operation_name = envelope.operation_name(),
            correlation_id = envelope.correlation_id(),
            scenario_id = envelope.scenario_id(),
            step_index = envelope.step_index(),
        );

        async move {
            let mut tx = ManagedTransaction::begin(&self.manager)
                .await
                .map_err(|e| item_failure(envelope, &e))?;

            match self.apply_in(&mut tx, envelope).await {
                Ok(ItemOutcome::Applied) => {
                    tx.commit().await.map_err(|e| item_failure(envelope, &e))?;
                    tracing::debug!("Envelope applied");
                    Ok(ItemOutcome::Applied)
                }
                Ok(ItemOutcome::Skipped) => {
                    discard(tx).await;
                    Ok(ItemOutcome::Skipped)
                }
                Err(error) => {
                    discard(tx).await;
                    Err(match error {
                        failure @ OutboxError::ItemApplyFailure { .. } => failure,
                        other => item_failure(envelope, &other),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn apply_in(
        &self,
        tx: &mut ManagedTransaction<M::Transaction>,
        envelope: &Envelope,
    ) -> Result<ItemOutcome, OutboxError> {
        let conn = tx.connection()?;

        if self.ledger.exists(conn, envelope.message_id()).await? {
            tracing::debug!("Envelope already processed, skipping");
            return Ok(ItemOutcome::Skipped);
        }

        let adapter = self
            .registry
            .require(envelope.operation_class(), envelope.operation_name())?;
        if !envelope.identity_matches() {
            tracing::warn!("Envelope id does not match its stable fields");
        }
        adapter.execute(conn, envelope.params()).await?;

        match self
            .ledger
            .mark_processed(conn, envelope.message_id(), self.clock.now())
            .await?
        {
            MarkOutcome::Recorded => Ok(ItemOutcome::Applied),
            MarkOutcome::AlreadyProcessed => {
                tracing::info!("Envelope was processed concurrently, discarding this application");
                Ok(ItemOutcome::Skipped)
            }
        }
    }
}

impl<M: TransactionManager> fmt::Debug for ReplayPoller<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayPoller")
            .field("max_batch", &self.max_batch)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

fn item_failure(envelope: &Envelope, reason: &impl fmt::Display) -> OutboxError {
    OutboxError::ItemApplyFailure {
        message_id: envelope.message_id().to_string(),
        reason: reason.to_string(),
    }
}

async fn discard<T: Transaction>(tx: ManagedTransaction<T>) {
    if let Err(error) = tx.rollback().await {
        tracing::warn!(error = %error, "Rollback failed");
    }
}
