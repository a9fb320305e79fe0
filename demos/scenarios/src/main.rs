//! Replays the sample scenarios from an in-memory primary into an in-memory
//! secondary.
//!
//! Run with:
//! ```bash
//! cargo run -p replay-outbox-demo
//! ```
//!
//! Set `OUTBOX_READ_BATCH_SIZE` or `OUTBOX_MASKED_PARAMS` to see the
//! configuration flow through, and `RUST_LOG=debug` for per-envelope logs and the
//! final Prometheus snapshot.

#![allow(missing_docs)]

use replay_outbox_core::AdapterRegistry;
use replay_outbox_runtime::metrics::MetricsServer;
use replay_outbox_runtime::{EnvelopeSender, Orchestrator, OutboxConfig, ParamMasker, ReplayPoller};
use replay_outbox_testing::fixtures::{self, Operation};
use replay_outbox_testing::ports::OUTBOX_TABLE;
use replay_outbox_testing::{
    InMemoryConnection, InMemoryDatabase, InMemoryInbox, InMemoryLedger, InMemoryOutbox,
    InMemoryTransport, RecordingAdapter,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// One recording adapter per sample operation, writing into its table.
fn sample_registry() -> anyhow::Result<Arc<AdapterRegistry<InMemoryConnection>>> {
    let registry: AdapterRegistry<InMemoryConnection> = AdapterRegistry::new();
    for (_, steps) in fixtures::scenarios() {
        for operation in steps {
            let table = fixtures::table_for(operation.class)
                .ok_or_else(|| anyhow::anyhow!("no table for {}", operation.class))?;
            registry.register(operation.class, operation.name, RecordingAdapter::new(table))?;
        }
    }
    Ok(Arc::new(registry))
}

async fn run_scenario(
    orchestrator: &Orchestrator<replay_outbox_testing::InMemoryTransactionManager>,
    scenario: &str,
    steps: [Operation; 2],
) -> anyhow::Result<()> {
    orchestrator
        .call_scenario(scenario, &format!("demo-{scenario}"), move |ctx| {
            Box::pin(async move {
                for step in steps {
                    ctx.execute_operation(step.class, step.name, step.params)
                        .await?;
                }
                Ok::<_, replay_outbox_core::OutboxError>(())
            })
        })
        .await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,replay_outbox_runtime=info".into()),
        )
        .with(fmt::layer())
        .init();

    tracing::info!("Starting replay outbox demo");

    // 1. Configuration
    let config = OutboxConfig::from_env()?;
    tracing::info!(
        send = %config.send.procedure_name,
        read = %config.read.procedure_name,
        batch_size = config.read.batch_size,
        version = %config.envelope.default_version,
        "✓ Configuration loaded"
    );

    // 2. Metrics recorder; the process is too short-lived to be scraped, so the
    //    snapshot is rendered at the end instead
    let mut metrics = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9090)));
    metrics.start()?;

    // 3. Primary and secondary stores joined by a transport
    let primary = InMemoryDatabase::new();
    let secondary = InMemoryDatabase::new();
    let transport = InMemoryTransport::new(primary.clone(), secondary.clone());
    let outbox = InMemoryOutbox::new();
    let inbox = InMemoryInbox::new();

    let orchestrator = Orchestrator::new(
        primary.transaction_manager(),
        sample_registry()?,
        EnvelopeSender::new(Arc::new(outbox.clone())),
    )
    .with_config(&config);

    let poller = ReplayPoller::new(
        secondary.transaction_manager(),
        Arc::new(inbox),
        Arc::new(InMemoryLedger),
        sample_registry()?,
    )
    .with_max_batch(config.read.batch_size)
    .with_masker(ParamMasker::from_config(&config.logging));
    tracing::info!("✓ Orchestrator and poller ready");

    // 4. Primary transactions
    for (scenario, steps) in fixtures::scenarios() {
        run_scenario(&orchestrator, scenario, steps).await?;
        tracing::info!(scenario, "✓ Scenario committed");
    }
    tracing::info!(
        outbox_rows = primary.count(OUTBOX_TABLE),
        send_calls = outbox.calls(),
        "✓ Primary side done"
    );

    // 5. Deliver and replay
    let forwarded = transport.forward();
    tracing::info!(forwarded, "✓ Envelopes delivered to the secondary inbox");

    let report = poller.poll_once().await?;
    tracing::info!(%report, "✓ First poll");

    // 6. Deliver everything again; the ledger turns it into skips
    let redelivered = transport.redeliver();
    let report = poller.poll_once().await?;
    tracing::info!(redelivered, %report, "✓ Redelivery poll");

    // 7. Compare both sides
    let mut diverged = 0;
    for (class, table) in fixtures::TABLES {
        let same = primary.rows(table) == secondary.rows(table);
        if !same {
            diverged += 1;
        }
        tracing::info!(class, table, rows = secondary.count(table), same, "Table");
    }
    tracing::info!(
        processed = InMemoryLedger::processed_ids(&secondary).len(),
        diverged,
        "✓ Demo complete"
    );
    if let Some(snapshot) = metrics.render() {
        tracing::debug!("Metrics snapshot:\n{snapshot}");
    }

    anyhow::ensure!(diverged == 0, "{diverged} tables diverged");
    Ok(())
}
