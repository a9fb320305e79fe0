//! # Replay Outbox Runtime
//!
//! The moving parts of the replay outbox, built on the types in
//! `replay-outbox-core`.
//!
//! ## Primary side
//!
//! - [`Orchestrator`]: runs a flow in one primary transaction; every successful
//!   operation produces an envelope that is sent before the next statement.
//! - [`TransactionalOutbox`]: records envelopes next to arbitrary statements and
//!   sends them all from a before-commit hook, on the same connection.
//! - [`EnvelopeSender`]: the send path shared by both.
//!
//! ## Secondary side
//!
//! - [`ReplayPoller`]: reads a batch, skips already processed envelopes, applies
//!   the rest through the adapter registry and records them in the ledger.
//! - [`FixedDelayScheduler`]: calls the poller again a fixed delay after each
//!   cycle.
//!
//! ## Ambient
//!
//! - [`config`]: procedure names, batch size, delay, version and log masking
//! - [`logging`]: param masking for log lines
//! - [`metrics`]: Prometheus counters and histograms
//!
//! ## Example
//!
//! ```ignore
//! use replay_outbox_runtime::{EnvelopeSender, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(manager, registry, EnvelopeSender::new(send_port));
//! orchestrator
//!     .call_in_primary_tx("checkout-7", |ctx| {
//!         Box::pin(async move {
//!             ctx.execute_operation("OrderSqlj", "insertOrder", params! { "orderId": 1001 }).await?;
//!             Ok::<_, OutboxError>(())
//!         })
//!     })
//!     .await?;
//! ```

/// Transactional send buffer flushed before commit
pub mod buffer;

/// Outbox and poller configuration
pub mod config;

/// Param masking for log output
pub mod logging;

/// Prometheus metrics for observability
pub mod metrics;

/// Primary-side orchestrator and execution context
pub mod orchestrator;

/// Secondary-side replay poller
pub mod poller;

/// Fixed-delay poll scheduling
pub mod scheduler;

/// Send path over an outbox port
pub mod sender;

pub use buffer::{DEFAULT_TARGET, TransactionalOutbox};
pub use config::{ConfigError, OutboxConfig};
pub use logging::ParamMasker;
pub use orchestrator::{ExecutionContext, Orchestrator, SendMode};
pub use poller::{PollReport, ReplayPoller};
pub use scheduler::{FixedDelayScheduler, SchedulerHandle};
pub use sender::EnvelopeSender;
