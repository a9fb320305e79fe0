//! The primary-side send path.
//!
//! [`EnvelopeSender`] writes one envelope through a [`SendToOutbox`] port on the
//! caller's transactional connection and turns anything but status `0` into
//! [`OutboxError::SendFailure`].

use crate::logging::ParamMasker;
use crate::metrics::OutboxMetrics;
use replay_outbox_core::ports::SendToOutbox;
use replay_outbox_core::{Envelope, OutboxError};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Status reported for a send call that could not be made at all.
pub const TRANSPORT_ERROR_STATUS: i32 = -1;

/// Sends envelopes through one outbox port.
pub struct EnvelopeSender<C> {
    port: Arc<dyn SendToOutbox<C>>,
    masker: ParamMasker,
}

impl<C> Clone for EnvelopeSender<C> {
    fn clone(&self) -> Self {
        Self {
            port: Arc::clone(&self.port),
            masker: self.masker.clone(),
        }
    }
}

impl<C: Send> EnvelopeSender<C> {
    /// Sender over `port` with no param masking.
    #[must_use]
    pub fn new(port: Arc<dyn SendToOutbox<C>>) -> Self {
        Self {
            port,
            masker: ParamMasker::default(),
        }
    }

    /// Mask params in log output.
    #[must_use]
    pub fn with_masker(mut self, masker: ParamMasker) -> Self {
        self.masker = masker;
        self
    }

    /// Send `envelope` as full JSON on `conn`.
    ///
    /// # Errors
    ///
    /// - [`OutboxError::SendFailure`] with the returned status if the call
    ///   rejected the envelope, or with [`TRANSPORT_ERROR_STATUS`] if the call
    ///   failed outright.
    /// - [`OutboxError::IdentitySerialization`] if the envelope cannot be written.
    pub async fn send(&self, conn: &mut C, envelope: &Envelope) -> Result<(), OutboxError> {
        let span = tracing::info_span!(
            "outbox_send",
            message_id = %envelope.message_id(),
            operation_class = envelope.operation_class(),
            operation_name = envelope.operation_name(),
            correlation_id = envelope.correlation_id(),
            scenario_id = envelope.scenario_id(),
            step_index = envelope.step_index(),
        );

        async move {
            let json = envelope.to_json()?;
            let started = Instant::now();

            let call = match self.port.send(conn, &json).await {
                Ok(call) => call,
                Err(error) => {
                    OutboxMetrics::record_send_failure();
                    tracing::error!(error = %error, "Send call failed");
                    return Err(OutboxError::SendFailure {
                        status: TRANSPORT_ERROR_STATUS,
                        message: format!("transport error: {error}"),
                    });
                }
            };

            if !call.is_ok() {
                OutboxMetrics::record_send_failure();
                let message = call
                    .error_message
                    .unwrap_or_else(|| "no error message".to_string());
                tracing::warn!(
                    status = call.status,
                    error_message = %message,
                    params = %self.masker.display(envelope.params()),
                    "Send call rejected envelope"
                );
                return Err(OutboxError::SendFailure {
                    status: call.status,
                    message,
                });
            }

            OutboxMetrics::record_sent(started.elapsed());
            tracing::debug!(
                params = %self.masker.display(envelope.params()),
                "Envelope sent"
            );
            Ok(())
        }
        .instrument(span)
        .await
    }
}
