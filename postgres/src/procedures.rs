//! Callers for the send and read-batch stored functions.
//!
//! Both functions report `(status, error_message)`; status `0` means success.
//! Function names are spliced into the statement text, so they are checked
//! against [`is_valid_procedure_name`] up front.

use crate::store_error;
use replay_outbox_core::BoxFuture;
use replay_outbox_core::StoreError;
use replay_outbox_core::ports::{
    CallStatus, ReadBatch, ReadBatchResult, SendToOutbox, is_valid_procedure_name,
};
use sqlx::PgConnection;

fn checked_name(name: String) -> Result<String, StoreError> {
    if is_valid_procedure_name(&name) {
        Ok(name)
    } else {
        Err(StoreError::Database(format!(
            "invalid function name {name:?}"
        )))
    }
}

/// Calls `<function>(envelope jsonb) RETURNS (status int, error_message text)`.
#[derive(Debug, Clone)]
pub struct PgSendProcedure {
    statement: String,
}

impl PgSendProcedure {
    /// Caller for `function`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if `function` is not a plain identifier.
    pub fn new(function: impl Into<String>) -> Result<Self, StoreError> {
        let function = checked_name(function.into())?;
        Ok(Self {
            statement: format!("SELECT status, error_message FROM {function}($1::jsonb)"),
        })
    }
}

impl SendToOutbox<PgConnection> for PgSendProcedure {
    fn send<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        envelope_json: &'a str,
    ) -> BoxFuture<'a, Result<CallStatus, StoreError>> {
        Box::pin(async move {
            let (status, error_message): (i32, Option<String>) = sqlx::query_as(&self.statement)
                .bind(envelope_json)
                .fetch_one(&mut *conn)
                .await
                .map_err(store_error)?;

            Ok(CallStatus {
                status,
                error_message,
            })
        })
    }
}

/// Calls `<function>(max_batch int) RETURNS (envelopes_json text, status int,
/// error_message text)`.
#[derive(Debug, Clone)]
pub struct PgReadProcedure {
    statement: String,
}

impl PgReadProcedure {
    /// Caller for `function`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if `function` is not a plain identifier.
    pub fn new(function: impl Into<String>) -> Result<Self, StoreError> {
        let function = checked_name(function.into())?;
        Ok(Self {
            statement: format!("SELECT envelopes_json, status, error_message FROM {function}($1)"),
        })
    }
}

impl ReadBatch<PgConnection> for PgReadProcedure {
    fn read_batch<'a>(
        &'a self,
        conn: &'a mut PgConnection,
        max_batch: u32,
    ) -> BoxFuture<'a, Result<ReadBatchResult, StoreError>> {
        Box::pin(async move {
            let limit = i32::try_from(max_batch).unwrap_or(i32::MAX);
            let (envelopes_json, status, error_message): (Option<String>, i32, Option<String>) =
                sqlx::query_as(&self.statement)
                    .bind(limit)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(store_error)?;

            Ok(ReadBatchResult {
                envelopes_json,
                status,
                error_message,
            })
        })
    }
}
