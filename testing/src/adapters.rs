//! Adapters for tests: one that writes its params as a row, one that always fails.

use crate::store::InMemoryConnection;
use futures::future::BoxFuture;
use replay_outbox_core::{Adapter, AdapterError, Params};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Inserts its params as one row into a fixed table and counts invocations.
#[derive(Debug)]
pub struct RecordingAdapter {
    table: String,
    invocations: AtomicUsize,
}

impl RecordingAdapter {
    /// Adapter writing into `table`.
    #[must_use]
    pub fn new(table: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            table: table.into(),
            invocations: AtomicUsize::new(0),
        })
    }

    /// Table rows are written to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Number of `execute` calls so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Adapter<InMemoryConnection> for RecordingAdapter {
    fn execute<'a>(
        &'a self,
        conn: &'a mut InMemoryConnection,
        params: &'a Params,
    ) -> BoxFuture<'a, Result<Value, AdapterError>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let row: Map<String, Value> = params
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        conn.insert(&self.table, Value::Object(row));
        Box::pin(async move { Ok(json!({ "rowsAffected": 1 })) })
    }
}

/// Fails every execution with [`AdapterError::Execution`].
#[derive(Debug)]
pub struct FailingAdapter {
    message: String,
    invocations: AtomicUsize,
}

impl FailingAdapter {
    /// Adapter failing with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            message: message.into(),
            invocations: AtomicUsize::new(0),
        })
    }

    /// Number of `execute` calls so far.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

impl Adapter<InMemoryConnection> for FailingAdapter {
    fn execute<'a>(
        &'a self,
        _conn: &'a mut InMemoryConnection,
        _params: &'a Params,
    ) -> BoxFuture<'a, Result<Value, AdapterError>> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let error = AdapterError::Execution(self.message.clone());
        Box::pin(async move { Err(error) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryDatabase;
    use replay_outbox_core::{Transaction, TransactionManager, params};

    #[tokio::test]
    async fn recording_adapter_writes_params_as_row() {
        let db = InMemoryDatabase::new();
        let adapter = RecordingAdapter::new("ORDERS");
        let mut tx = db.transaction_manager().begin().await.unwrap();

        let params = params! { "orderId": 1001, "amount": "42.50" };
        adapter.execute(tx.connection(), &params).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(adapter.invocations(), 1);
        assert_eq!(
            db.rows("ORDERS"),
            vec![json!({ "orderId": 1001, "amount": "42.50" })]
        );
    }

    #[tokio::test]
    async fn failing_adapter_fails() {
        let db = InMemoryDatabase::new();
        let adapter = FailingAdapter::new("constraint violated");
        let mut tx = db.transaction_manager().begin().await.unwrap();

        let result = adapter.execute(tx.connection(), &Params::new()).await;
        assert_eq!(
            result,
            Err(AdapterError::Execution("constraint violated".to_string()))
        );
        assert_eq!(adapter.invocations(), 1);
    }
}
