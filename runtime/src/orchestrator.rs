//! Primary-side orchestrator.
//!
//! [`Orchestrator::call_in_primary_tx`] opens one primary transaction, hands an
//! [`ExecutionContext`] to the caller's flow, and commits only if the flow and
//! every operation in it succeeded:
//!
//! ```text
//! Idle ──begin──► TxOpen ──flow──► Executing* ──Ok──► Committing ──► Committed
//!                                      └──any failure──────────────► RolledBack
//! ```
//!
//! Each successful [`ExecutionContext::execute_operation`] builds an envelope and
//! sends it on the same connection before the next statement runs. A failed send
//! rolls back the whole transaction, so no business mutation becomes visible
//! without its replay record, and no replay record without its mutation.

use crate::config::OutboxConfig;
use crate::logging::ParamMasker;
use crate::metrics::OutboxMetrics;
use crate::sender::EnvelopeSender;
use futures::future::BoxFuture;
use replay_outbox_core::environment::{Clock, SystemClock};
use replay_outbox_core::{
    AdapterRegistry, ConnectionOf, DEFAULT_VERSION, Envelope, EnvelopeBuilder, ManagedTransaction,
    MessageId, OutboxError, Params, Transaction, TransactionHandle, TransactionManager,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::Instrument;

/// Whether a successful operation sends its envelope right away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendMode {
    /// Build and send the envelope immediately after the adapter succeeds.
    #[default]
    Auto,
    /// Send nothing; the caller sends manually.
    Manual,
}

/// Runs flows inside primary transactions.
pub struct Orchestrator<M: TransactionManager> {
    manager: M,
    registry: Arc<AdapterRegistry<ConnectionOf<M>>>,
    sender: Arc<EnvelopeSender<ConnectionOf<M>>>,
    clock: Arc<dyn Clock>,
    default_version: String,
    masker: ParamMasker,
}

impl<M: TransactionManager> Orchestrator<M> {
    /// Orchestrator with the system clock and version `v1`.
    #[must_use]
    pub fn new(
        manager: M,
        registry: Arc<AdapterRegistry<ConnectionOf<M>>>,
        sender: EnvelopeSender<ConnectionOf<M>>,
    ) -> Self {
        Self {
            manager,
            registry,
            sender: Arc::new(sender),
            clock: Arc::new(SystemClock),
            default_version: DEFAULT_VERSION.to_string(),
            masker: ParamMasker::default(),
        }
    }

    /// Use `clock` for envelope timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Version tag for envelopes built without an explicit one.
    #[must_use]
    pub fn with_default_version(mut self, version: impl Into<String>) -> Self {
        self.default_version = version.into();
        self
    }

    /// Mask params in log output, including the sender's.
    #[must_use]
    pub fn with_masker(mut self, masker: ParamMasker) -> Self {
        self.sender = Arc::new(self.sender.as_ref().clone().with_masker(masker.clone()));
        self.masker = masker;
        self
    }

    /// Apply envelope defaults and log masking from `config`.
    #[must_use]
    pub fn with_config(self, config: &OutboxConfig) -> Self {
        self.with_default_version(config.envelope.default_version.clone())
            .with_masker(ParamMasker::from_config(&config.logging))
    }

    /// The adapter registry operations dispatch through.
    #[must_use]
    pub const fn registry(&self) -> &Arc<AdapterRegistry<ConnectionOf<M>>> {
        &self.registry
    }

    /// Run `flow` in a new primary transaction.
    ///
    /// Commits when `flow` returns `Ok` and nothing inside it failed; otherwise
    /// rolls back and returns the failure.
    ///
    /// # Example
    ///
    /// ```ignore
    /// orchestrator
    ///     .call_in_primary_tx("checkout-7", |ctx| {
    ///         Box::pin(async move {
    ///             ctx.execute_operation("OrderSqlj", "insertOrder", params! { "orderId": 1001 }).await?;
    ///             ctx.execute_operation("InventorySqlj", "updateStock", params! { "productId": 77 }).await?;
    ///             Ok::<_, OutboxError>(())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    ///
    /// # Errors
    ///
    /// Returns the flow's error, the first swallowed operation failure, or the
    /// commit failure, converted into `E`.
    pub async fn call_in_primary_tx<R, E, F>(&self, correlation_id: &str, flow: F) -> Result<R, E>
    where
        F: for<'c> FnOnce(&'c mut ExecutionContext<M::Transaction>) -> BoxFuture<'c, Result<R, E>>,
        E: From<OutboxError>,
    {
        self.run(correlation_id, None, flow).await
    }

    /// Like [`call_in_primary_tx`](Self::call_in_primary_tx), tagging every
    /// envelope with `scenario_id` and its 1-based step index.
    ///
    /// # Errors
    ///
    /// Same as [`call_in_primary_tx`](Self::call_in_primary_tx).
    pub async fn call_scenario<R, E, F>(
        &self,
        scenario_id: &str,
        correlation_id: &str,
        flow: F,
    ) -> Result<R, E>
    where
        F: for<'c> FnOnce(&'c mut ExecutionContext<M::Transaction>) -> BoxFuture<'c, Result<R, E>>,
        E: From<OutboxError>,
    {
        self.run(correlation_id, Some(scenario_id), flow).await
    }

    async fn run<R, E, F>(
        &self,
        correlation_id: &str,
        scenario_id: Option<&str>,
        flow: F,
    ) -> Result<R, E>
    where
        F: for<'c> FnOnce(&'c mut ExecutionContext<M::Transaction>) -> BoxFuture<'c, Result<R, E>>,
        E: From<OutboxError>,
    {
        let span = tracing::info_span!("primary_tx", correlation_id, scenario_id);

        async move {
            let tx = ManagedTransaction::begin(&self.manager)
                .await
                .map_err(|e| E::from(OutboxError::from(e)))?;
            tracing::debug!(transaction_id = %tx.id(), "Primary transaction opened");

            let mut ctx = ExecutionContext {
                tx,
                registry: Arc::clone(&self.registry),
                sender: Arc::clone(&self.sender),
                clock: Arc::clone(&self.clock),
                masker: self.masker.clone(),
                correlation_id: correlation_id.to_string(),
                scenario_id: scenario_id.map(ToString::to_string),
                default_version: self.default_version.clone(),
                next_step: 1,
                sent: Vec::new(),
                rollback_cause: None,
            };

            let outcome = flow(&mut ctx).await;
            let ExecutionContext {
                tx,
                sent,
                rollback_cause,
                ..
            } = ctx;

            match (outcome, rollback_cause) {
                (Ok(value), None) => match tx.commit().await {
                    Ok(()) => {
                        OutboxMetrics::record_transaction(true);
                        tracing::info!(envelopes = sent.len(), "Primary transaction committed");
                        Ok(value)
                    }
                    Err(error) => {
                        OutboxMetrics::record_transaction(false);
                        tracing::warn!(error = %error, "Primary transaction failed to commit");
                        Err(E::from(error))
                    }
                },
                (Ok(_), Some(cause)) => {
                    tracing::warn!(
                        error = %cause,
                        "Flow returned Ok after a failed operation, rolling back"
                    );
                    rollback(tx).await;
                    Err(E::from(cause))
                }
                (Err(error), _) => {
                    rollback(tx).await;
                    Err(error)
                }
            }
        }
        .instrument(span)
        .await
    }
}

async fn rollback<T: Transaction>(tx: ManagedTransaction<T>) {
    OutboxMetrics::record_transaction(false);
    match tx.rollback().await {
        Ok(()) => tracing::info!("Primary transaction rolled back"),
        Err(error) => tracing::error!(error = %error, "Primary transaction rollback failed"),
    }
}

/// Imperative surface handed to a flow; bound to one open primary transaction.
pub struct ExecutionContext<T: Transaction> {
    tx: ManagedTransaction<T>,
    registry: Arc<AdapterRegistry<T::Connection>>,
    sender: Arc<EnvelopeSender<T::Connection>>,
    clock: Arc<dyn Clock>,
    masker: ParamMasker,
    correlation_id: String,
    scenario_id: Option<String>,
    default_version: String,
    next_step: u32,
    sent: Vec<MessageId>,
    rollback_cause: Option<OutboxError>,
}

impl<T: Transaction> ExecutionContext<T> {
    /// Run an operation and send its envelope.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::NoAdapterRegistered`] on a dispatch miss
    /// - [`OutboxError::Adapter`] if the adapter failed
    /// - [`OutboxError::SendFailure`] if the envelope was not accepted
    ///
    /// Any of these marks the transaction for rollback.
    pub async fn execute_operation(
        &mut self,
        operation_class: &str,
        operation_name: &str,
        params: Params,
    ) -> Result<Value, OutboxError> {
        self.execute_operation_with(operation_class, operation_name, params, SendMode::Auto)
            .await
    }

    /// Run an operation, sending its envelope only in [`SendMode::Auto`].
    ///
    /// # Errors
    ///
    /// Same as [`execute_operation`](Self::execute_operation).
    pub async fn execute_operation_with(
        &mut self,
        operation_class: &str,
        operation_name: &str,
        params: Params,
        mode: SendMode,
    ) -> Result<Value, OutboxError> {
        let outcome = self
            .try_execute(operation_class, operation_name, params, mode)
            .await;
        if let Err(error) = &outcome {
            self.mark_rollback_only(error);
        }
        outcome
    }

    async fn try_execute(
        &mut self,
        operation_class: &str,
        operation_name: &str,
        params: Params,
        mode: SendMode,
    ) -> Result<Value, OutboxError> {
        let adapter = self.registry.require(operation_class, operation_name)?;
        tracing::debug!(
            operation_class,
            operation_name,
            params = %self.masker.display(&params),
            "Executing operation"
        );
        let result = adapter.execute(self.tx.connection()?, &params).await?;

        if mode == SendMode::Auto {
            let envelope = self
                .envelope_builder(operation_class, operation_name)
                .params(params)
                .build()?;
            self.send_in_tx(&envelope).await?;
        }
        Ok(result)
    }

    /// Send a caller-built envelope on this transaction's connection.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::SendFailure`] if the envelope was not accepted; the
    /// transaction is then marked for rollback.
    pub async fn send_manually(&mut self, envelope: &Envelope) -> Result<(), OutboxError> {
        let outcome = self.send_in_tx(envelope).await;
        if let Err(error) = &outcome {
            self.mark_rollback_only(error);
        }
        outcome
    }

    /// Envelope builder carrying this context's correlation id, default
    /// version, timestamp and (in a scenario) the next step index.
    pub fn envelope_builder(
        &mut self,
        operation_class: &str,
        operation_name: &str,
    ) -> EnvelopeBuilder {
        let mut builder = Envelope::builder(operation_class, operation_name)
            .version(self.default_version.clone())
            .correlation_id(self.correlation_id.clone())
            .created_at(self.clock.now());
        if let Some(scenario_id) = &self.scenario_id {
            builder = builder.scenario(scenario_id.clone(), self.next_step);
            self.next_step += 1;
        }
        builder
    }

    /// Build an envelope with this context's defaults.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::IdentitySerialization`] if `params` cannot be
    /// written canonically.
    pub fn envelope_for(
        &mut self,
        operation_class: &str,
        operation_name: &str,
        params: Params,
    ) -> Result<Envelope, OutboxError> {
        let built = self
            .envelope_builder(operation_class, operation_name)
            .params(params)
            .build();
        if let Err(error) = &built {
            self.mark_rollback_only(error);
        }
        built
    }

    /// The transactional connection, for statements that are not replayed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NoActiveTransaction`] if the transaction is gone.
    pub fn connection(&mut self) -> Result<&mut T::Connection, OutboxError> {
        self.tx.connection()
    }

    /// Hook registration token of the open transaction.
    #[must_use]
    pub fn transaction(&self) -> TransactionHandle<T::Connection> {
        self.tx.handle()
    }

    /// Correlation id of this call.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Scenario id, when run through [`Orchestrator::call_scenario`].
    #[must_use]
    pub fn scenario_id(&self) -> Option<&str> {
        self.scenario_id.as_deref()
    }

    /// Ids of the envelopes sent so far, in send order.
    #[must_use]
    pub fn sent(&self) -> &[MessageId] {
        &self.sent
    }

    /// Whether a failure already doomed this transaction.
    #[must_use]
    pub const fn is_rollback_only(&self) -> bool {
        self.rollback_cause.is_some()
    }

    async fn send_in_tx(&mut self, envelope: &Envelope) -> Result<(), OutboxError> {
        self.sender.send(self.tx.connection()?, envelope).await?;
        self.sent.push(envelope.message_id().clone());
        Ok(())
    }

    fn mark_rollback_only(&mut self, error: &OutboxError) {
        if self.rollback_cause.is_none() {
            self.rollback_cause = Some(error.clone());
        }
    }
}
