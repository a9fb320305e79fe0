//! End-to-end replay: primary flows, transport, secondary poller.
//!
//! The secondary store must end up with exactly the mutations the primary
//! committed, no matter how often the transport delivers them.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{SampleAdapters, orchestrator, poller, table_rows};
use replay_outbox_core::OutboxError;
use replay_outbox_runtime::{FixedDelayScheduler, PollReport};
use replay_outbox_testing::fixtures::{self, Operation};
use replay_outbox_testing::ports::{INBOX_TABLE, OUTBOX_TABLE};
use replay_outbox_testing::{
    InMemoryDatabase, InMemoryInbox, InMemoryLedger, InMemoryOutbox, InMemoryTransport,
};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Replication {
    primary: InMemoryDatabase,
    secondary: InMemoryDatabase,
    primary_adapters: SampleAdapters,
    secondary_adapters: SampleAdapters,
    outbox: InMemoryOutbox,
    inbox: InMemoryInbox,
    transport: InMemoryTransport,
}

impl Replication {
    fn new(outbox: InMemoryOutbox) -> Self {
        replay_outbox_testing::init_tracing();
        let primary = InMemoryDatabase::new();
        let secondary = InMemoryDatabase::new();
        Self {
            transport: InMemoryTransport::new(primary.clone(), secondary.clone()),
            primary,
            secondary,
            primary_adapters: SampleAdapters::new(),
            secondary_adapters: SampleAdapters::new(),
            outbox,
            inbox: InMemoryInbox::new(),
        }
    }

    async fn run_scenario(
        &self,
        scenario: &str,
        steps: [Operation; 2],
    ) -> Result<(), OutboxError> {
        let orchestrator = orchestrator(
            &self.primary,
            self.primary_adapters.registry.clone(),
            &self.outbox,
        );
        orchestrator
            .call_scenario(scenario, &format!("corr-{scenario}"), move |ctx| {
                Box::pin(async move {
                    for step in steps {
                        ctx.execute_operation(step.class, step.name, step.params)
                            .await?;
                    }
                    Ok(())
                })
            })
            .await
    }

    fn assert_tables_match(&self) {
        for (_, steps) in fixtures::scenarios() {
            for operation in &steps {
                assert_eq!(
                    table_rows(&self.primary, operation),
                    table_rows(&self.secondary, operation),
                    "{} diverged",
                    operation.class
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn secondary_converges_on_committed_primary_state() {
    let replication = Replication::new(InMemoryOutbox::new());
    for (scenario, steps) in fixtures::scenarios() {
        replication.run_scenario(scenario, steps).await.unwrap();
    }
    assert_eq!(replication.primary.count(OUTBOX_TABLE), 6);

    assert_eq!(replication.transport.forward(), 6);
    let poller = poller(
        &replication.secondary,
        replication.secondary_adapters.registry.clone(),
        &replication.inbox,
    );
    let report = poller.poll_once().await.unwrap();

    assert_eq!(
        report,
        PollReport {
            received: 6,
            applied: 6,
            skipped: 0,
            failed: 0,
        }
    );
    replication.assert_tables_match();
    assert_eq!(InMemoryLedger::processed_ids(&replication.secondary).len(), 6);
}

#[tokio::test]
async fn redelivery_leaves_secondary_unchanged() {
    let replication = Replication::new(InMemoryOutbox::new());
    for (scenario, steps) in fixtures::scenarios() {
        replication.run_scenario(scenario, steps).await.unwrap();
    }
    let poller = poller(
        &replication.secondary,
        replication.secondary_adapters.registry.clone(),
        &replication.inbox,
    );
    replication.transport.forward();
    poller.poll_once().await.unwrap();

    assert_eq!(replication.transport.redeliver(), 6);
    let report = poller.poll_once().await.unwrap();

    assert_eq!(report.skipped, 6);
    assert_eq!(report.applied, 0);
    assert_eq!(replication.secondary_adapters.invocations("OrderSqlj"), 1);
    replication.assert_tables_match();
}

#[tokio::test]
async fn rolled_back_scenario_produces_nothing_to_replay() {
    let outbox = InMemoryOutbox::new().reject_when_param("paymentAmount", 300, 20001, "queue full");
    let replication = Replication::new(outbox);

    for (scenario, steps) in fixtures::scenarios() {
        let result = replication.run_scenario(scenario, steps).await;
        assert_eq!(result.is_err(), scenario == "Installment", "{scenario}");
    }

    assert_eq!(replication.transport.forward(), 4);
    let poller = poller(
        &replication.secondary,
        replication.secondary_adapters.registry.clone(),
        &replication.inbox,
    );
    assert_eq!(poller.poll_once().await.unwrap().applied, 4);
    assert_eq!(replication.secondary.count("INSTALLMENTS"), 0);
    assert_eq!(replication.primary.count("INSTALLMENTS"), 0);
    replication.assert_tables_match();
}

#[tokio::test]
async fn scheduler_keeps_polling_until_shut_down() {
    let replication = Replication::new(InMemoryOutbox::new());
    let poller = Arc::new(poller(
        &replication.secondary,
        replication.secondary_adapters.registry.clone(),
        &replication.inbox,
    ));
    let scheduler = FixedDelayScheduler::new(Duration::from_millis(5));
    assert_eq!(scheduler.delay(), Duration::from_millis(5));
    let handle = scheduler.spawn(Arc::clone(&poller));

    // Work arrives after the loop started; a later cycle must pick it up.
    for (scenario, steps) in fixtures::scenarios() {
        replication.run_scenario(scenario, steps).await.unwrap();
    }
    replication.transport.forward();

    let mut waited = 0;
    while InMemoryLedger::processed_ids(&replication.secondary).len() < 6 {
        assert!(waited < 400, "scheduler never drained the inbox");
        tokio::time::sleep(Duration::from_millis(5)).await;
        waited += 1;
    }

    assert!(!handle.is_finished());
    handle.shutdown().await.unwrap();
    assert_eq!(replication.secondary.count(INBOX_TABLE), 0);
    replication.assert_tables_match();
}
