//! Runs the outbox reader (C4) and the search indexer (C7) as two
//! cooperating consumer loops against the same database pool and broker.

use anyhow::{Context, Result};
use learnloop_core::broker::BrokerClient;
use learnloop_core::indexer::Indexer;
use learnloop_core::outbox::OutboxReader;
use learnloop_core::Config;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "learnloop_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(feature = "kafka")]
fn build_broker(config: &Config) -> Result<Arc<dyn BrokerClient>> {
    let client = learnloop_core::broker::KafkaBrokerClient::new(&config.broker_bootstrap, "outbox-indexer")
        .context("failed to build Kafka broker client")?;
    Ok(Arc::new(client))
}

#[cfg(not(feature = "kafka"))]
fn build_broker(_config: &Config) -> Result<Arc<dyn BrokerClient>> {
    Ok(learnloop_core::broker::InMemoryBroker::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = Config::from_env();
    info!("outbox-indexer starting up");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let broker = build_broker(&config)?;

    let reader = OutboxReader::new(pool.clone(), broker.clone(), config.outbox.clone());
    reader.ensure_schema().await.context("failed to ensure outbox schema")?;

    let indexer = Indexer::new(broker, pool, config.indexer.clone());
    indexer.ensure_checkpoint_schema().await.context("failed to ensure indexer checkpoint schema")?;
    indexer.ensure_indices().await.context("failed to ensure search indices")?;

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let reader_rx = cancel_rx.clone();
    let reader_task = tokio::spawn(async move { reader.run(reader_rx).await });

    let indexer_rx = cancel_rx.clone();
    let indexer_task = tokio::spawn(async move { indexer.run(indexer_rx).await });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining outbox-indexer");
    let _ = cancel_tx.send(true);

    let _ = tokio::time::timeout(config.shutdown_grace, async {
        let _ = reader_task.await;
        let _ = indexer_task.await;
    })
    .await;

    Ok(())
}
