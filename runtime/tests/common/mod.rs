//! Shared fixtures for the runtime integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use replay_outbox_core::{AdapterRegistry, Envelope};
use replay_outbox_runtime::{EnvelopeSender, Orchestrator, ReplayPoller};
use replay_outbox_testing::fixtures::{self, Operation};
use replay_outbox_testing::{
    InMemoryConnection, InMemoryDatabase, InMemoryInbox, InMemoryLedger, InMemoryOutbox,
    InMemoryTransactionManager, RecordingAdapter, test_clock,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub type Registry = AdapterRegistry<InMemoryConnection>;

/// Registry holding a recording adapter for every sample operation.
pub struct SampleAdapters {
    pub registry: Arc<Registry>,
    pub by_class: HashMap<&'static str, Arc<RecordingAdapter>>,
}

impl SampleAdapters {
    pub fn new() -> Self {
        let registry: Arc<Registry> = Arc::new(AdapterRegistry::new());
        let mut by_class = HashMap::new();
        for (_, steps) in fixtures::scenarios() {
            for operation in steps {
                let table = fixtures::table_for(operation.class).expect("sample table");
                let adapter = RecordingAdapter::new(table);
                registry
                    .register(operation.class, operation.name, adapter.clone())
                    .expect("register sample adapter");
                by_class.insert(operation.class, adapter);
            }
        }
        Self { registry, by_class }
    }

    pub fn invocations(&self, class: &str) -> usize {
        self.by_class[class].invocations()
    }
}

pub fn orchestrator(
    db: &InMemoryDatabase,
    registry: Arc<Registry>,
    outbox: &InMemoryOutbox,
) -> Orchestrator<InMemoryTransactionManager> {
    Orchestrator::new(
        db.transaction_manager(),
        registry,
        EnvelopeSender::new(Arc::new(outbox.clone())),
    )
    .with_clock(Arc::new(test_clock()))
}

pub fn poller(
    db: &InMemoryDatabase,
    registry: Arc<Registry>,
    inbox: &InMemoryInbox,
) -> ReplayPoller<InMemoryTransactionManager> {
    ReplayPoller::new(
        db.transaction_manager(),
        Arc::new(inbox.clone()),
        Arc::new(InMemoryLedger),
        registry,
    )
    .with_clock(Arc::new(test_clock()))
}

pub fn envelope(operation: &Operation) -> Envelope {
    Envelope::builder(operation.class, operation.name)
        .params(operation.params.clone())
        .created_at(replay_outbox_core::environment::Clock::now(&test_clock()))
        .build()
        .expect("sample envelope")
}

/// Envelopes stored in committed outbox rows, in insertion order.
pub fn outbox_envelopes(db: &InMemoryDatabase) -> Vec<Envelope> {
    db.rows(replay_outbox_testing::ports::OUTBOX_TABLE)
        .iter()
        .map(|row| {
            Envelope::from_json(row["envelopeJson"].as_str().expect("envelope json"))
                .expect("stored envelope parses")
        })
        .collect()
}

/// Connection ids recorded with committed outbox rows.
pub fn outbox_connections(db: &InMemoryDatabase) -> Vec<u64> {
    db.rows(replay_outbox_testing::ports::OUTBOX_TABLE)
        .iter()
        .map(|row| row["connection"].as_u64().expect("connection id"))
        .collect()
}

/// Committed rows of the table `operation` writes to.
pub fn table_rows(db: &InMemoryDatabase, operation: &Operation) -> Vec<Value> {
    db.rows(fixtures::table_for(operation.class).expect("sample table"))
}
