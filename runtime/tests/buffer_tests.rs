//! Integration tests for the transactional send buffer
//!
//! Envelopes recorded during a transaction must reach the outbox only at commit,
//! in recording order, on the transaction's own connection, and must vanish
//! with the transaction when it does not commit.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{SampleAdapters, envelope, orchestrator, outbox_connections, outbox_envelopes};
use replay_outbox_core::{Envelope, ManagedTransaction, OutboxError};
use replay_outbox_runtime::{DEFAULT_TARGET, EnvelopeSender, TransactionalOutbox};
use replay_outbox_testing::fixtures::{insert_order, update_stock};
use replay_outbox_testing::ports::OUTBOX_TABLE;
use replay_outbox_testing::{InMemoryConnection, InMemoryDatabase, InMemoryOutbox};
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Test Fixtures
// ============================================================================

fn buffer(port: &InMemoryOutbox) -> TransactionalOutbox<InMemoryConnection> {
    TransactionalOutbox::new(EnvelopeSender::new(Arc::new(port.clone())))
}

fn order_envelope(order_id: u64) -> Envelope {
    Envelope::builder("OrderSqlj", "insertOrder")
        .param("orderId", order_id)
        .build()
        .unwrap()
}

fn order_ids(envelopes: &[Envelope]) -> Vec<u64> {
    envelopes
        .iter()
        .map(|e| e.params()["orderId"].as_u64().unwrap())
        .collect()
}

// ============================================================================
// Flush on commit
// ============================================================================

#[tokio::test]
async fn commit_flushes_in_recording_order_on_same_connection() {
    replay_outbox_testing::init_tracing();
    let db = InMemoryDatabase::new();
    let port = InMemoryOutbox::new();
    let outbox = buffer(&port);

    let mut tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();
    let connection = tx.connection().unwrap().id();
    tx.connection()
        .unwrap()
        .insert("ORDERS", json!({ "orderId": 1 }));
    for order_id in 1..=3 {
        outbox.record(&tx.handle(), order_envelope(order_id)).unwrap();
    }

    assert_eq!(outbox.pending(tx.id(), DEFAULT_TARGET), 3);
    assert_eq!(tx.connection().unwrap().count(OUTBOX_TABLE), 0);
    assert_eq!(port.calls(), 0);

    let id = tx.id();
    tx.commit().await.unwrap();

    assert_eq!(order_ids(&outbox_envelopes(&db)), vec![1, 2, 3]);
    assert_eq!(outbox_connections(&db), vec![connection; 3]);
    assert_eq!(db.count("ORDERS"), 1);
    assert_eq!(outbox.pending(id, DEFAULT_TARGET), 0);
}

#[tokio::test]
async fn failing_flush_aborts_commit_and_persists_nothing() {
    let db = InMemoryDatabase::new();
    let port = InMemoryOutbox::new().reject_when_param("orderId", 2, 20001, "queue full");
    let outbox = buffer(&port);

    let mut tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();
    tx.connection()
        .unwrap()
        .insert("ORDERS", json!({ "orderId": 1 }));
    for order_id in 1..=3 {
        outbox.record(&tx.handle(), order_envelope(order_id)).unwrap();
    }
    let id = tx.id();

    let error = tx.commit().await.unwrap_err();

    assert!(matches!(error, OutboxError::CommitAborted { .. }));
    assert_eq!(
        error.root_cause(),
        &OutboxError::SendFailure {
            status: 20001,
            message: "queue full".to_string(),
        }
    );
    // The flush stopped at the rejected envelope.
    assert_eq!(port.calls(), 2);
    assert_eq!(db.count("ORDERS"), 0);
    assert_eq!(db.count(OUTBOX_TABLE), 0);
    assert_eq!(outbox.pending(id, DEFAULT_TARGET), 0);
}

// ============================================================================
// Completion without commit
// ============================================================================

#[tokio::test]
async fn rollback_discards_buffer() {
    let db = InMemoryDatabase::new();
    let port = InMemoryOutbox::new();
    let outbox = buffer(&port);

    let tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();
    outbox.record(&tx.handle(), order_envelope(1)).unwrap();
    outbox.record(&tx.handle(), order_envelope(2)).unwrap();
    let id = tx.id();

    tx.rollback().await.unwrap();

    assert_eq!(outbox.pending(id, DEFAULT_TARGET), 0);
    assert_eq!(port.calls(), 0);
    assert_eq!(db.count(OUTBOX_TABLE), 0);
}

#[tokio::test]
async fn dropped_transaction_discards_buffer() {
    let db = InMemoryDatabase::new();
    let port = InMemoryOutbox::new();
    let outbox = buffer(&port);

    let tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();
    outbox.record(&tx.handle(), order_envelope(1)).unwrap();
    let id = tx.id();
    drop(tx);

    assert_eq!(outbox.pending(id, DEFAULT_TARGET), 0);
    assert_eq!(port.calls(), 0);
}

#[tokio::test]
async fn recording_after_completion_is_rejected() {
    let db = InMemoryDatabase::new();
    let outbox = buffer(&InMemoryOutbox::new());

    let tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();
    let handle = tx.handle();
    tx.commit().await.unwrap();

    assert_eq!(
        outbox.record(&handle, order_envelope(1)),
        Err(OutboxError::NoActiveTransaction)
    );
    assert_eq!(db.count(OUTBOX_TABLE), 0);
}

// ============================================================================
// Targets
// ============================================================================

#[tokio::test]
async fn unknown_target_is_rejected() {
    let db = InMemoryDatabase::new();
    let outbox = buffer(&InMemoryOutbox::new());

    let tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();

    assert_eq!(
        outbox.record_to(&tx.handle(), "audit", order_envelope(1)),
        Err(OutboxError::UnknownSendTarget("audit".to_string()))
    );
    assert_eq!(outbox.pending(tx.id(), "audit"), 0);
}

#[tokio::test]
async fn each_target_flushes_through_its_own_port() {
    let db = InMemoryDatabase::new();
    let primary = InMemoryOutbox::new();
    let audit = InMemoryOutbox::new();
    let outbox =
        buffer(&primary).with_target("audit", EnvelopeSender::new(Arc::new(audit.clone())));
    assert_eq!(outbox.targets(), vec!["audit", DEFAULT_TARGET]);

    let tx = ManagedTransaction::begin(&db.transaction_manager())
        .await
        .unwrap();
    outbox.record(&tx.handle(), order_envelope(1)).unwrap();
    outbox
        .record_to(&tx.handle(), "audit", order_envelope(2))
        .unwrap();
    outbox
        .record_to(&tx.handle(), "audit", order_envelope(3))
        .unwrap();
    assert_eq!(outbox.pending(tx.id(), DEFAULT_TARGET), 1);
    assert_eq!(outbox.pending(tx.id(), "audit"), 2);

    tx.commit().await.unwrap();

    assert_eq!(primary.calls(), 1);
    assert_eq!(audit.calls(), 2);
    assert_eq!(order_ids(&outbox_envelopes(&db)), vec![1, 2, 3]);
}

#[tokio::test]
async fn transactions_have_separate_buffers() {
    let db = InMemoryDatabase::new();
    let outbox = buffer(&InMemoryOutbox::new());
    let manager = db.transaction_manager();

    let first = ManagedTransaction::begin(&manager).await.unwrap();
    let second = ManagedTransaction::begin(&manager).await.unwrap();
    outbox.record(&first.handle(), order_envelope(1)).unwrap();
    outbox.record(&second.handle(), order_envelope(2)).unwrap();
    outbox.record(&second.handle(), order_envelope(3)).unwrap();
    assert_eq!(outbox.pending(first.id(), DEFAULT_TARGET), 1);
    assert_eq!(outbox.pending(second.id(), DEFAULT_TARGET), 2);

    let second_id = second.id();
    first.commit().await.unwrap();
    second.rollback().await.unwrap();

    assert_eq!(order_ids(&outbox_envelopes(&db)), vec![1]);
    assert_eq!(outbox.pending(second_id, DEFAULT_TARGET), 0);
}

// ============================================================================
// Together with the orchestrator
// ============================================================================

#[tokio::test]
async fn buffer_rides_on_an_orchestrated_transaction() {
    let db = InMemoryDatabase::new();
    let adapters = SampleAdapters::new();
    let port = InMemoryOutbox::new();
    let orchestrator = orchestrator(&db, adapters.registry.clone(), &port);
    let outbox = buffer(&port);
    let (order, stock) = (insert_order(), update_stock());
    let recorded = envelope(&stock);

    let flow_outbox = outbox.clone();
    orchestrator
        .call_in_primary_tx("corr-buffer", move |ctx| {
            Box::pin(async move {
                ctx.execute_operation(order.class, order.name, order.params)
                    .await?;
                // A statement run directly on the connection, recorded by hand.
                ctx.connection()?
                    .insert("INVENTORY", json!(stock.params));
                flow_outbox.record(&ctx.transaction(), recorded)?;
                Ok::<_, OutboxError>(())
            })
        })
        .await
        .unwrap();

    let envelopes = outbox_envelopes(&db);
    let classes: Vec<&str> = envelopes.iter().map(Envelope::operation_class).collect();
    assert_eq!(classes, vec!["OrderSqlj", "InventorySqlj"]);
    assert_eq!(db.count("INVENTORY"), 1);
    assert_eq!(adapters.invocations("InventorySqlj"), 0);
}

#[tokio::test]
async fn failed_flow_never_flushes() {
    let db = InMemoryDatabase::new();
    let adapters = SampleAdapters::new();
    let port = InMemoryOutbox::new();
    let orchestrator = orchestrator(&db, adapters.registry.clone(), &port);
    let outbox = buffer(&port);
    let recorded = order_envelope(1);

    let flow_outbox = outbox.clone();
    let result = orchestrator
        .call_in_primary_tx("corr-buffer-2", move |ctx| {
            Box::pin(async move {
                flow_outbox.record(&ctx.transaction(), recorded)?;
                ctx.execute_operation("GhostSqlj", "haunt", replay_outbox_core::params! {})
                    .await?;
                Ok::<_, OutboxError>(())
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(port.calls(), 0);
    assert_eq!(db.count(OUTBOX_TABLE), 0);
}
