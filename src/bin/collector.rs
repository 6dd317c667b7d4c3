//! Event ingestion HTTP service: publishes to the broker, spools to disk on
//! outage, and sweeps the spool back onto the broker once it recovers.

use anyhow::{Context, Result};
use learnloop_core::broker::BrokerClient;
use learnloop_core::collector::{self, CollectorState, CollectorStats};
use learnloop_core::spool::DiskSpool;
use learnloop_core::sweeper::SpoolSweeper;
use learnloop_core::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "learnloop_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(feature = "kafka")]
fn build_broker(config: &Config) -> Result<Arc<dyn BrokerClient>> {
    let client = learnloop_core::broker::KafkaBrokerClient::new(&config.broker_bootstrap, "collector")
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
    info!("event collector starting up");

    let broker = build_broker(&config)?;
    let spool = Arc::new(
        DiskSpool::new(config.collector.spool.dir.clone(), config.collector.spool.max_age)
            .context("failed to open disk spool")?,
    );

    let state = Arc::new(CollectorState {
        broker: broker.clone(),
        spool: spool.clone(),
        config: config.collector.clone(),
        stats: CollectorStats::default(),
    });

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let sweeper = SpoolSweeper::new(broker, spool, config.collector.clone(), config.sweep_interval);
    let sweeper_rx = cancel_rx.clone();
    let sweeper_task = tokio::spawn(async move { sweeper.run(sweeper_rx).await });

    let app = collector::router(state);

    let listener = TcpListener::bind(&config.bind_addr).await.context("failed to bind collector listener")?;
    info!(addr = %config.bind_addr, "collector listening");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining collector");
        });

    server.await.context("collector server error")?;

    let _ = cancel_tx.send(true);
    tokio::time::timeout(config.shutdown_grace, sweeper_task).await.ok();
    Ok(())
}
