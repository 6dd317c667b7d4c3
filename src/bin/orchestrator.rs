//! Stateful rules engine service: consumes learner events, applies the
//! rules engine under a per-learner lock, and dispatches resulting actions.

use anyhow::{Context, Result};
use learnloop_core::broker::BrokerClient;
use learnloop_core::dispatcher::ActionDispatcher;
use learnloop_core::learner_state::LearnerStateStore;
use learnloop_core::orchestrator::Orchestrator;
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
    let client = learnloop_core::broker::KafkaBrokerClient::new(&config.broker_bootstrap, "orchestrator")
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
    info!("orchestrator starting up");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let broker = build_broker(&config)?;

    let state_store = Arc::new(LearnerStateStore::with_capacity(pool.clone(), config.learner_state.cache_capacity));
    state_store.ensure_schema().await.context("failed to ensure learner_state schema")?;

    let dispatcher = Arc::new(ActionDispatcher::new(config.dispatcher.clone(), broker.clone()));

    let orchestrator = Orchestrator::new(
        broker,
        state_store,
        dispatcher,
        config.rules.clone(),
        config.orchestrator.clone(),
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let orchestrator = Arc::new(orchestrator);
    let run_orchestrator = orchestrator.clone();
    let task = tokio::spawn(async move { run_orchestrator.run(cancel_rx).await });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining orchestrator");
    let _ = cancel_tx.send(true);
    let _ = tokio::time::timeout(config.shutdown_grace, task).await;

    Ok(())
}
