//! In-memory versions of the store ports, plus a transport that moves committed
//! outbox rows into a secondary inbox.
//!
//! Table layout:
//!
//! | table | row |
//! |-------|-----|
//! | [`OUTBOX_TABLE`] | `{ "messageId", "envelopeJson", "connection" }` |
//! | [`INBOX_TABLE`] | `{ "messageId", "envelopeJson" }` |
//! | [`PROCESSED_TABLE`] | `{ "messageId", "processedAt" }` |

use crate::store::{InMemoryConnection, InMemoryDatabase};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use replay_outbox_core::ports::{
    CallStatus, MarkOutcome, ProcessedLedger, ReadBatch, ReadBatchResult, SendToOutbox,
};
use replay_outbox_core::{Envelope, MessageId, StoreError};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Primary-side outbox table.
pub const OUTBOX_TABLE: &str = "OUTBOX";

/// Secondary-side delivery queue.
pub const INBOX_TABLE: &str = "INBOX";

/// Secondary-side idempotency ledger.
pub const PROCESSED_TABLE: &str = "processed_message";

/// Status returned when the outbox receives text that is not an envelope.
pub const MALFORMED_ENVELOPE_STATUS: i32 = 2;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
enum SendRule {
    RejectParam {
        key: String,
        value: Value,
        status: i32,
        message: String,
    },
    RejectAll {
        status: i32,
        message: String,
    },
    Transport(String),
}

enum SendDecision {
    Accept(Value),
    Reject(i32, String),
    Transport(String),
}

/// [`SendToOutbox`] that appends envelopes to [`OUTBOX_TABLE`] on the caller's
/// connection.
///
/// Rules decide which envelopes are rejected with a non-zero status or fail as if
/// the call never reached the store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutbox {
    rules: Arc<Mutex<Vec<SendRule>>>,
    calls: Arc<AtomicUsize>,
}

impl InMemoryOutbox {
    /// Outbox accepting every envelope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject envelopes whose params hold `key == value`.
    #[must_use]
    pub fn reject_when_param(
        self,
        key: impl Into<String>,
        value: impl Into<Value>,
        status: i32,
        message: impl Into<String>,
    ) -> Self {
        lock(&self.rules).push(SendRule::RejectParam {
            key: key.into(),
            value: value.into(),
            status,
            message: message.into(),
        });
        self
    }

    /// Reject every envelope.
    #[must_use]
    pub fn reject_all(self, status: i32, message: impl Into<String>) -> Self {
        lock(&self.rules).push(SendRule::RejectAll {
            status,
            message: message.into(),
        });
        self
    }

    /// Fail every call with a [`StoreError`].
    #[must_use]
    pub fn fail_transport(self, message: impl Into<String>) -> Self {
        lock(&self.rules).push(SendRule::Transport(message.into()));
        self
    }

    /// Drop all rules.
    pub fn accept_all(&self) {
        lock(&self.rules).clear();
    }

    /// Number of send calls so far, accepted or not.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn decide(&self, envelope_json: &str) -> SendDecision {
        let Ok(envelope) = serde_json::from_str::<Value>(envelope_json) else {
            return SendDecision::Reject(MALFORMED_ENVELOPE_STATUS, "envelope is not JSON".into());
        };
        for rule in lock(&self.rules).iter() {
            match rule {
                SendRule::RejectParam {
                    key,
                    value,
                    status,
                    message,
                } if envelope["params"].get(key) == Some(value) => {
                    return SendDecision::Reject(*status, message.clone());
                }
                SendRule::RejectParam { .. } => {}
                SendRule::RejectAll { status, message } => {
                    return SendDecision::Reject(*status, message.clone());
                }
                SendRule::Transport(message) => return SendDecision::Transport(message.clone()),
            }
        }
        SendDecision::Accept(envelope)
    }
}

impl SendToOutbox<InMemoryConnection> for InMemoryOutbox {
    fn send<'a>(
        &'a self,
        conn: &'a mut InMemoryConnection,
        envelope_json: &'a str,
    ) -> BoxFuture<'a, Result<CallStatus, StoreError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = match self.decide(envelope_json) {
            SendDecision::Accept(envelope) => {
                let connection = conn.id();
                conn.insert(
                    OUTBOX_TABLE,
                    json!({
                        "messageId": envelope["messageId"],
                        "envelopeJson": envelope_json,
                        "connection": connection,
                    }),
                );
                Ok(CallStatus::ok())
            }
            SendDecision::Reject(status, message) => Ok(CallStatus::failed(status, message)),
            SendDecision::Transport(message) => Err(StoreError::Database(message)),
        };
        Box::pin(async move { result })
    }
}

#[derive(Debug, Clone, Default)]
enum ReadMode {
    #[default]
    Dequeue,
    Fail(i32, String),
    Transport(String),
    Raw(Option<String>),
}

/// [`ReadBatch`] that dequeues rows of [`INBOX_TABLE`] on the caller's connection.
///
/// Dequeued rows are gone once the read transaction commits; if it rolls back
/// they stay queued.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInbox {
    mode: Arc<Mutex<ReadMode>>,
    reads: Arc<AtomicUsize>,
}

impl InMemoryInbox {
    /// Inbox dequeuing from [`INBOX_TABLE`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `status` on every read until [`recover`](Self::recover).
    pub fn fail_with(&self, status: i32, message: impl Into<String>) {
        *lock(&self.mode) = ReadMode::Fail(status, message.into());
    }

    /// Fail every read with a [`StoreError`] until [`recover`](Self::recover).
    pub fn fail_transport(&self, message: impl Into<String>) {
        *lock(&self.mode) = ReadMode::Transport(message.into());
    }

    /// Return `payload` verbatim on every read until [`recover`](Self::recover).
    pub fn respond_with(&self, payload: Option<String>) {
        *lock(&self.mode) = ReadMode::Raw(payload);
    }

    /// Go back to dequeuing.
    pub fn recover(&self) {
        *lock(&self.mode) = ReadMode::Dequeue;
    }

    /// Number of read calls so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Queue `envelope` for delivery on `db`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the envelope has no JSON form.
    pub fn enqueue(db: &InMemoryDatabase, envelope: &Envelope) -> Result<(), StoreError> {
        let json = envelope
            .to_json()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Self::enqueue_json(db, envelope.message_id().as_str(), json);
        Ok(())
    }

    /// Queue raw envelope JSON for delivery on `db`.
    pub fn enqueue_json(db: &InMemoryDatabase, message_id: &str, envelope_json: impl Into<String>) {
        db.insert(
            INBOX_TABLE,
            json!({ "messageId": message_id, "envelopeJson": envelope_json.into() }),
        );
    }
}

impl ReadBatch<InMemoryConnection> for InMemoryInbox {
    fn read_batch<'a>(
        &'a self,
        conn: &'a mut InMemoryConnection,
        max_batch: u32,
    ) -> BoxFuture<'a, Result<ReadBatchResult, StoreError>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mode = lock(&self.mode).clone();
        let result = match mode {
            ReadMode::Dequeue => {
                let limit = usize::try_from(max_batch).unwrap_or(usize::MAX);
                let rows = conn.take_front(INBOX_TABLE, limit);
                if rows.is_empty() {
                    Ok(ReadBatchResult {
                        envelopes_json: None,
                        status: 0,
                        error_message: None,
                    })
                } else {
                    let items: Vec<&str> = rows
                        .iter()
                        .filter_map(|row| row["envelopeJson"].as_str())
                        .collect();
                    Ok(ReadBatchResult::ok(format!("[{}]", items.join(","))))
                }
            }
            ReadMode::Fail(status, message) => Ok(ReadBatchResult::failed(status, message)),
            ReadMode::Transport(message) => Err(StoreError::Database(message)),
            ReadMode::Raw(payload) => Ok(ReadBatchResult {
                envelopes_json: payload,
                status: 0,
                error_message: None,
            }),
        };
        Box::pin(async move { result })
    }
}

/// [`ProcessedLedger`] over [`PROCESSED_TABLE`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryLedger;

impl InMemoryLedger {
    /// Ledger row for `message_id`, as the store would write it.
    #[must_use]
    pub fn row(message_id: &MessageId, processed_at: DateTime<Utc>) -> Value {
        json!({
            "messageId": message_id.as_str(),
            "processedAt": processed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    /// Committed ids in `db`'s ledger, in insertion order.
    #[must_use]
    pub fn processed_ids(db: &InMemoryDatabase) -> Vec<String> {
        db.rows(PROCESSED_TABLE)
            .iter()
            .filter_map(|row| row["messageId"].as_str().map(str::to_string))
            .collect()
    }

    fn holds(conn: &InMemoryConnection, message_id: &MessageId) -> bool {
        conn.contains(PROCESSED_TABLE, |row| {
            row["messageId"].as_str() == Some(message_id.as_str())
        })
    }
}

impl ProcessedLedger<InMemoryConnection> for InMemoryLedger {
    fn exists<'a>(
        &'a self,
        conn: &'a mut InMemoryConnection,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        let found = Self::holds(conn, message_id);
        Box::pin(async move { Ok(found) })
    }

    fn mark_processed<'a>(
        &'a self,
        conn: &'a mut InMemoryConnection,
        message_id: &'a MessageId,
        processed_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<MarkOutcome, StoreError>> {
        let outcome = if Self::holds(conn, message_id) {
            MarkOutcome::AlreadyProcessed
        } else {
            conn.insert(PROCESSED_TABLE, Self::row(message_id, processed_at));
            MarkOutcome::Recorded
        };
        Box::pin(async move { Ok(outcome) })
    }
}

/// Moves committed outbox rows from a primary database into a secondary inbox.
///
/// Everything ever forwarded is remembered so it can be delivered again, which is
/// how at-least-once redelivery is simulated.
#[derive(Debug, Clone)]
pub struct InMemoryTransport {
    primary: InMemoryDatabase,
    secondary: InMemoryDatabase,
    delivered: Arc<Mutex<Vec<Value>>>,
}

impl InMemoryTransport {
    /// Transport from `primary`'s outbox to `secondary`'s inbox.
    #[must_use]
    pub fn new(primary: InMemoryDatabase, secondary: InMemoryDatabase) -> Self {
        Self {
            primary,
            secondary,
            delivered: Arc::default(),
        }
    }

    /// Drain the primary outbox into the secondary inbox, preserving order.
    ///
    /// Returns the number of envelopes moved.
    pub fn forward(&self) -> usize {
        let rows = self.primary.drain(OUTBOX_TABLE);
        for row in &rows {
            self.deliver(row);
        }
        let moved = rows.len();
        lock(&self.delivered).extend(rows);
        if moved > 0 {
            tracing::debug!(moved, "Forwarded outbox rows");
        }
        moved
    }

    /// Deliver every previously forwarded envelope once more.
    ///
    /// Returns the number of envelopes re-queued.
    pub fn redeliver(&self) -> usize {
        let rows = lock(&self.delivered).clone();
        for row in &rows {
            self.deliver(row);
        }
        rows.len()
    }

    fn deliver(&self, row: &Value) {
        self.secondary.insert(
            INBOX_TABLE,
            json!({ "messageId": row["messageId"], "envelopeJson": row["envelopeJson"] }),
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use replay_outbox_core::{Transaction, TransactionManager};

    fn envelope(order_id: u64) -> Envelope {
        Envelope::builder("OrderSqlj", "insertOrder")
            .param("orderId", order_id)
            .build()
            .expect("envelope")
    }

    #[tokio::test]
    async fn outbox_writes_on_callers_connection() {
        let db = InMemoryDatabase::new();
        let outbox = InMemoryOutbox::new();
        let mut tx = db.transaction_manager().begin().await.unwrap();
        let json = envelope(1).to_json().unwrap();

        let status = outbox.send(tx.connection(), &json).await.unwrap();
        assert!(status.is_ok());
        assert_eq!(tx.connection().count(OUTBOX_TABLE), 1);
        assert_eq!(db.count(OUTBOX_TABLE), 0);

        tx.commit().await.unwrap();
        assert_eq!(db.count(OUTBOX_TABLE), 1);
        assert_eq!(outbox.calls(), 1);
    }

    #[tokio::test]
    async fn outbox_rules_reject_matching_params() {
        let db = InMemoryDatabase::new();
        let outbox = InMemoryOutbox::new().reject_when_param("orderId", 2, 20001, "queue full");
        let mut tx = db.transaction_manager().begin().await.unwrap();

        let first = outbox
            .send(tx.connection(), &envelope(1).to_json().unwrap())
            .await
            .unwrap();
        let second = outbox
            .send(tx.connection(), &envelope(2).to_json().unwrap())
            .await
            .unwrap();

        assert!(first.is_ok());
        assert_eq!(second, CallStatus::failed(20001, "queue full"));
        assert_eq!(tx.connection().count(OUTBOX_TABLE), 1);
    }

    #[tokio::test]
    async fn outbox_transport_failure_is_an_error() {
        let db = InMemoryDatabase::new();
        let outbox = InMemoryOutbox::new().fail_transport("connection reset");
        let mut tx = db.transaction_manager().begin().await.unwrap();

        let result = outbox
            .send(tx.connection(), &envelope(1).to_json().unwrap())
            .await;
        assert_eq!(
            result,
            Err(StoreError::Database("connection reset".to_string()))
        );
    }

    #[tokio::test]
    async fn inbox_reads_in_queue_order_up_to_limit() {
        let db = InMemoryDatabase::new();
        for id in 1..=3 {
            InMemoryInbox::enqueue(&db, &envelope(id)).unwrap();
        }
        let inbox = InMemoryInbox::new();
        let mut tx = db.transaction_manager().begin().await.unwrap();

        let result = inbox.read_batch(tx.connection(), 2).await.unwrap();
        let batch = Envelope::parse_batch(result.envelopes_json.as_deref()).unwrap();
        let ids: Vec<_> = batch.iter().map(|e| e.params()["orderId"].clone()).collect();
        assert_eq!(ids, vec![json!(1), json!(2)]);

        tx.commit().await.unwrap();
        assert_eq!(db.count(INBOX_TABLE), 1);
    }

    #[tokio::test]
    async fn empty_inbox_returns_no_payload() {
        let db = InMemoryDatabase::new();
        let mut tx = db.transaction_manager().begin().await.unwrap();
        let result = InMemoryInbox::new()
            .read_batch(tx.connection(), 10)
            .await
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(result.envelopes_json, None);
    }

    #[tokio::test]
    async fn ledger_marks_once() {
        let db = InMemoryDatabase::new();
        let ledger = InMemoryLedger;
        let id = MessageId::new("abc");
        let mut tx = db.transaction_manager().begin().await.unwrap();

        assert!(!ledger.exists(tx.connection(), &id).await.unwrap());
        let now = Utc::now();
        assert_eq!(
            ledger.mark_processed(tx.connection(), &id, now).await.unwrap(),
            MarkOutcome::Recorded
        );
        assert_eq!(
            ledger.mark_processed(tx.connection(), &id, now).await.unwrap(),
            MarkOutcome::AlreadyProcessed
        );
        assert!(ledger.exists(tx.connection(), &id).await.unwrap());

        tx.commit().await.unwrap();
        assert_eq!(InMemoryLedger::processed_ids(&db), vec!["abc".to_string()]);
    }

    #[tokio::test]
    async fn transport_forwards_and_redelivers() {
        let primary = InMemoryDatabase::new();
        let secondary = InMemoryDatabase::new();
        let mut tx = primary.transaction_manager().begin().await.unwrap();
        InMemoryOutbox::new()
            .send(tx.connection(), &envelope(1).to_json().unwrap())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let transport = InMemoryTransport::new(primary.clone(), secondary.clone());
        assert_eq!(transport.forward(), 1);
        assert_eq!(primary.count(OUTBOX_TABLE), 0);
        assert_eq!(secondary.count(INBOX_TABLE), 1);

        assert_eq!(transport.forward(), 0);
        assert_eq!(transport.redeliver(), 1);
        assert_eq!(secondary.count(INBOX_TABLE), 2);
    }
}
