//! The `processed_message` idempotency ledger.

use crate::store_error;
use chrono::{DateTime, Utc};
use replay_outbox_core::ports::{MarkOutcome, ProcessedLedger};
use replay_outbox_core::{BoxFuture, MessageId, StoreError};
use sqlx::PgConnection;

/// Ledger over `processed_message(message_id TEXT PRIMARY KEY, processed_at
/// TIMESTAMPTZ NOT NULL)`.
///
/// `mark_processed` is a single `INSERT .. ON CONFLICT DO NOTHING`, so two
/// pollers racing on one id never both record it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgProcessedLedger;

impl ProcessedLedger<PgConnection> for PgProcessedLedger {
    fn exists<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        message_id: &'a MessageId,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(async move {
            let (found,): (bool,) = sqlx::query_as(
                "SELECT EXISTS (SELECT 1 FROM processed_message WHERE message_id = $1)",
            )
            .bind(message_id.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(store_error)?;
            Ok(found)
        })
    }

    fn mark_processed<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        message_id: &'a MessageId,
        processed_at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<MarkOutcome, StoreError>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO processed_message (message_id, processed_at)
                VALUES ($1, $2)
                ON CONFLICT (message_id) DO NOTHING
                ",
            )
            .bind(message_id.as_str())
            .bind(processed_at)
            .execute(&mut *conn)
            .await
            .map_err(store_error)?;

            if result.rows_affected() == 1 {
                Ok(MarkOutcome::Recorded)
            } else {
                tracing::debug!(message_id = %message_id, "Ledger row already present");
                metrics::counter!("replay_ledger_conflicts_total").increment(1);
                Ok(MarkOutcome::AlreadyProcessed)
            }
        })
    }
}
