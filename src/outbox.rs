//! Polls the transactional outbox table and publishes ordered change
//! events onto the broker, advancing a checkpoint in the same transaction
//! that marks rows processed (C4).

use crate::broker::BrokerClient;
use crate::config::OutboxConfig;
use crate::error::OutboxError;
use crate::model::{CheckpointRecord, OutboxRecord};
use sqlx::PgPool;
use std::sync::Arc;

pub struct OutboxReader {
    pool: PgPool,
    broker: Arc<dyn BrokerClient>,
    config: OutboxConfig,
}

impl OutboxReader {
    pub fn new(pool: PgPool, broker: Arc<dyn BrokerClient>, config: OutboxConfig) -> Self {
        Self { pool, broker, config }
    }

    pub async fn ensure_schema(&self) -> Result<(), OutboxError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id BIGSERIAL PRIMARY KEY,
                aggregate_id TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                processed_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_checkpoint (
                consumer_name TEXT PRIMARY KEY,
                last_processed_id BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_checkpoint(&self) -> Result<i64, OutboxError> {
        let row = sqlx::query_as::<_, CheckpointRecord>(
            "SELECT consumer_name, last_processed_id, updated_at FROM cdc_checkpoint WHERE consumer_name = $1",
        )
        .bind(&self.config.consumer_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.last_processed_id).unwrap_or(0))
    }

    async fn fetch_batch(&self, after_id: i64) -> Result<Vec<OutboxRecord>, OutboxError> {
        let rows = sqlx::query_as::<_, OutboxRecord>(
            r#"
            SELECT id, aggregate_type, aggregate_id, event_type, event_data, created_at, processed_at
            FROM outbox_events
            WHERE processed_at IS NULL AND id > $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after_id)
        .bind(self.config.batch_size)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Runs one poll-publish-commit cycle. Returns the number of rows
    /// processed, so the caller can back off when nothing is pending.
    pub async fn run_once(&self) -> Result<usize, OutboxError> {
        let checkpoint = self.load_checkpoint().await?;
        let batch = self.fetch_batch(checkpoint).await?;
        if batch.is_empty() {
            return Ok(0);
        }

        for record in &batch {
            let topic = format!("cdc.{}", record.aggregate_type);
            let value = serde_json::to_vec(record).unwrap_or_default();
            self.broker.publish(&topic, &record.aggregate_id, value).await?;
        }

        let max_id = batch.iter().map(|r| r.id).max().unwrap_or(checkpoint);
        if max_id < checkpoint {
            return Err(OutboxError::CheckpointRegression {
                consumer: self.config.consumer_name.clone(),
                had: checkpoint,
                new: max_id,
            });
        }

        let mut tx = self.pool.begin().await?;
        let ids: Vec<i64> = batch.iter().map(|r| r.id).collect();
        sqlx::query("UPDATE outbox_events SET processed_at = now() WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO cdc_checkpoint (consumer_name, last_processed_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (consumer_name) DO UPDATE SET last_processed_id = $2, updated_at = now()
            "#,
        )
        .bind(&self.config.consumer_name)
        .bind(max_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(batch.len())
    }

    pub async fn run(&self, cancel: tokio::sync::watch::Receiver<bool>) {
        let mut cancel = cancel;
        loop {
            if *cancel.borrow() {
                return;
            }
            match self.run_once().await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = cancel.changed() => {}
                    }
                }
                Ok(n) => {
                    tracing::debug!(processed = n, "outbox batch published");
                }
                Err(e) => {
                    tracing::error!(error = %e, "outbox poll failed, backing off");
                    tokio::time::sleep(self.config.poll_interval * 2).await;
                }
            }
        }
    }
}
