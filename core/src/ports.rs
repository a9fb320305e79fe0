//! Store-side ports: the send call, the read-batch call and the idempotency ledger.
//!
//! These are the only places the outbox touches a concrete store. Production
//! implementations call stored functions (`replay-outbox-postgres`); tests use the
//! in-memory versions from `replay-outbox-testing`.
//!
//! Every port receives the connection of the transaction it must run in, so the
//! caller decides atomicity.

use crate::envelope::MessageId;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

/// Result of a stored call reporting `(status, error_message)`.
///
/// `status == 0` means accepted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallStatus {
    /// Zero on success.
    pub status: i32,
    /// Error text when `status != 0`.
    pub error_message: Option<String>,
}

impl CallStatus {
    /// Status `0`.
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            status: 0,
            error_message: None,
        }
    }

    /// Non-zero status with a message.
    #[must_use]
    pub fn failed(status: i32, error_message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(error_message.into()),
        }
    }

    /// Whether the call was accepted.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Result of the read-batch call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadBatchResult {
    /// JSON array of envelopes; absent or blank means an empty batch.
    pub envelopes_json: Option<String>,
    /// Zero on success.
    pub status: i32,
    /// Error text when `status != 0`.
    pub error_message: Option<String>,
}

impl ReadBatchResult {
    /// Successful read returning `envelopes_json`.
    #[must_use]
    pub fn ok(envelopes_json: impl Into<String>) -> Self {
        Self {
            envelopes_json: Some(envelopes_json.into()),
            status: 0,
            error_message: None,
        }
    }

    /// Failed read.
    #[must_use]
    pub fn failed(status: i32, error_message: impl Into<String>) -> Self {
        Self {
            envelopes_json: None,
            status,
            error_message: Some(error_message.into()),
        }
    }

    /// Whether the read succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status == 0
    }
}

/// Outcome of an insert-if-absent ledger write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MarkOutcome {
    /// A new ledger row was written.
    Recorded,
    /// A row for this id already existed; nothing was written.
    AlreadyProcessed,
}

/// Primary-side send call: persists one envelope in the outbox store.
pub trait SendToOutbox<C>: Send + Sync {
    /// Hand the full envelope JSON to the store using `conn`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the call could not be made at all. A rejected
    /// envelope is an `Ok` with a non-zero [`CallStatus`].
    fn send<'a>(
        &'a self,
        conn: &'a mut C,
        envelope_json: &'a str,
    ) -> BoxFuture<'a, Result<CallStatus, StoreError>>;
}

/// Secondary-side read-batch call.
pub trait ReadBatch<C>: Send + Sync {
    /// Read up to `max_batch` pending envelopes.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the call could not be made at all.
    fn read_batch<'a>(
        &'a self,
        conn: &'a mut C,
        max_batch: u32,
    ) -> BoxFuture<'a, Result<ReadBatchResult, StoreError>>;
}

/// Secondary-side idempotency ledger (`processed_message`).
///
/// At most one row exists per message id; `mark_processed` must be an atomic
/// insert-if-absent at the storage layer.
pub trait ProcessedLedger<C>: Send + Sync {
    /// Whether `message_id` was already applied.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the lookup fails.
    fn exists<'a>(
        &'a self,
        conn: &'a mut C,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    /// Record `message_id` as applied at `processed_at`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the write fails for any reason other than an
    /// existing row.
    fn mark_processed<'a>(
        &'a self,
        conn: &'a mut C,
        message_id: &'a MessageId,
        processed_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<MarkOutcome, StoreError>>;
}

/// Whether `name` is safe to splice into SQL as a function name: `name` or
/// `schema.name`, each part `[A-Za-z_][A-Za-z0-9_]*`.
#[must_use]
pub fn is_valid_procedure_name(name: &str) -> bool {
    let mut parts = 0;
    for part in name.split('.') {
        parts += 1;
        let mut chars = part.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return false;
        }
    }
    parts <= 2
}
