//! Prometheus metrics for the send path and the replay poller.
//!
//! Recorders are plain functions over the global `metrics` recorder, so they are
//! no-ops until a recorder (for example [`MetricsServer`]) is installed.
//!
//! [`MetricsServer::serve`] exposes a scrape endpoint on the configured address.
//! [`MetricsServer::start`] only installs the recorder; the caller then serves
//! [`MetricsServer::render`] itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use replay_outbox_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics exporter.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address [`serve`](Self::serve) listens on (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests) this logs a warning and
    /// succeeds without a handle.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        match Self::builder()?.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!(
                        "Metrics recorder already initialized, skipping re-initialization"
                    );
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install the recorder and serve `GET /metrics` on the configured address.
    ///
    /// Must be called from within a Tokio runtime; the listener runs on a
    /// spawned task for the rest of the process.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the listener cannot be bound, or
    /// [`MetricsError::Install`] if another recorder is already installed.
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = Self::builder()?
            .with_http_listener(self.addr)
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            if exporter.await.is_err() {
                // `ExporterError` implements neither `Debug` nor `Display` in 0.15.
                tracing::error!("Metrics endpoint stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics endpoint listening");
        Ok(())
    }

    fn builder() -> Result<PrometheusBuilder, MetricsError> {
        PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Primary side
    describe_counter!(
        "outbox_envelopes_sent_total",
        "Envelopes accepted by the send call"
    );
    describe_counter!(
        "outbox_send_failures_total",
        "Send calls that returned a non-zero status or a transport error"
    );
    describe_counter!(
        "outbox_envelopes_recorded_total",
        "Envelopes recorded into a transactional send buffer"
    );
    describe_counter!(
        "outbox_transactions_total",
        "Orchestrated primary transactions by outcome"
    );
    describe_histogram!(
        "outbox_send_duration_seconds",
        "Time taken by one send call"
    );

    // Secondary side
    describe_counter!(
        "replay_envelopes_received_total",
        "Envelopes returned by the read-batch call"
    );
    describe_counter!(
        "replay_envelopes_applied_total",
        "Envelopes applied and marked processed"
    );
    describe_counter!(
        "replay_envelopes_skipped_total",
        "Envelopes skipped because they were already processed"
    );
    describe_counter!(
        "replay_envelopes_failed_total",
        "Envelopes whose application failed"
    );
    describe_counter!(
        "replay_batch_failures_total",
        "Poll cycles aborted by a failed batch read"
    );
    describe_counter!(
        "replay_ledger_conflicts_total",
        "Ledger inserts that found the id already recorded"
    );
    describe_histogram!(
        "replay_poll_duration_seconds",
        "Time taken by one poll cycle"
    );
}

/// Primary-side metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record an accepted send.
    pub fn record_sent(duration: Duration) {
        counter!("outbox_envelopes_sent_total").increment(1);
        histogram!("outbox_send_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed send.
    pub fn record_send_failure() {
        counter!("outbox_send_failures_total").increment(1);
    }

    /// Record an envelope buffered for flush at commit.
    pub fn record_recorded() {
        counter!("outbox_envelopes_recorded_total").increment(1);
    }

    /// Record the outcome of an orchestrated transaction.
    pub fn record_transaction(committed: bool) {
        let outcome = if committed { "committed" } else { "rolled_back" };
        counter!("outbox_transactions_total", "outcome" => outcome).increment(1);
    }
}

/// Secondary-side metrics recorder.
pub struct ReplayMetrics;

impl ReplayMetrics {
    /// Record one finished poll cycle.
    pub fn record_cycle(
        received: usize,
        applied: usize,
        skipped: usize,
        failed: usize,
        duration: Duration,
    ) {
        counter!("replay_envelopes_received_total").increment(received as u64);
        counter!("replay_envelopes_applied_total").increment(applied as u64);
        counter!("replay_envelopes_skipped_total").increment(skipped as u64);
        counter!("replay_envelopes_failed_total").increment(failed as u64);
        histogram!("replay_poll_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a poll cycle aborted by the batch read.
    pub fn record_batch_failure() {
        counter!("replay_batch_failures_total").increment(1);
    }
}
