//! Error taxonomy shared across the ingestion and orchestration cores.
//!
//! Each component gets its own error enum via `thiserror`; `CoreError`
//! aggregates them for binary entry points that just want `anyhow::Result`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spool segment corrupted: {path}")]
    Corrupted { path: String },
    #[error("segment serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("invalid request body: {0}")]
    BadRequest(String),
    #[error("batch exceeds maximum size of {max} events")]
    BatchTooLarge { max: usize },
    #[error("decompressed body exceeds {max_bytes} bytes")]
    BodyTooLarge { max_bytes: usize },
    #[error("all events rejected")]
    AllRejected,
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("checkpoint went backwards: consumer={consumer} had={had} new={new}")]
    CheckpointRegression { consumer: String, had: i64, new: i64 },
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search engine request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bulk response carried {failed} item failures")]
    PartialFailure { failed: usize },
    #[error(transparent)]
    Store(#[from] OutboxError),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("request build failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("circuit open for target {target}")]
    CircuitOpen { target: String },
    #[error("terminal downstream failure: status={status}")]
    Terminal { status: u16 },
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Collector(#[from] CollectorError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Spool(#[from] SpoolError),
    #[error(transparent)]
    Outbox(#[from] OutboxError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Store(#[from] sqlx::Error),
    #[error("integrity violation, refusing to continue: {0}")]
    Fatal(String),
}
