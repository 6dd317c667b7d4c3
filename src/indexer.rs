//! Consumes CDC change events, runs them through the transform/access-filter
//! pipeline, and writes bulk operations to the search engine (C7).

use crate::access_filter::AccessFilter;
use crate::broker::BrokerClient;
use crate::config::IndexerConfig;
use crate::error::IndexError;
use crate::model::OutboxRecord;
use crate::transform::Transformer;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;

fn index_name_for(aggregate_type: &str) -> &'static str {
    match aggregate_type {
        "learner" | "user" => "learners",
        "lesson" | "course" => "lessons",
        "assessment" => "assessments",
        _ => "misc",
    }
}

pub struct Indexer {
    broker: Arc<dyn BrokerClient>,
    http: reqwest::Client,
    config: IndexerConfig,
    pool: PgPool,
}

impl Indexer {
    pub fn new(broker: Arc<dyn BrokerClient>, pool: PgPool, config: IndexerConfig) -> Self {
        Self { broker, http: reqwest::Client::new(), config, pool }
    }

    pub async fn ensure_checkpoint_schema(&self) -> Result<(), IndexError> {
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
        .await
        .map_err(crate::error::OutboxError::from)?;
        Ok(())
    }

    fn checkpoint_name(&self, topic: &str) -> String {
        format!("{}:{}", self.config.consumer_name, topic)
    }

    /// Records the highest `OutboxRecord.id` actually processed in this
    /// batch. `GREATEST` keeps the column monotonic even if an older batch
    /// is ever retried after a newer one already advanced it.
    async fn advance_checkpoint(&self, topic: &str, last_id: i64) -> Result<(), IndexError> {
        sqlx::query(
            r#"
            INSERT INTO cdc_checkpoint (consumer_name, last_processed_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (consumer_name) DO UPDATE
                SET last_processed_id = GREATEST(cdc_checkpoint.last_processed_id, EXCLUDED.last_processed_id),
                    updated_at = now()
            "#,
        )
        .bind(self.checkpoint_name(topic))
        .bind(last_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::OutboxError::from)?;
        Ok(())
    }

    /// Polls every `cdc.<aggregate_type>` topic once, flushing each topic's
    /// batch through the transform/access-filter/bulk pipeline and advancing
    /// its checkpoint. Returns the total number of messages consumed, so the
    /// caller can back off when nothing is pending.
    pub async fn run_once(&self) -> Result<usize, IndexError> {
        let mut total = 0usize;
        for aggregate_type in &self.config.aggregate_types {
            let topic = format!("cdc.{aggregate_type}");
            let messages = self
                .broker
                .poll(&topic, self.config.bulk_size)
                .await
                .map_err(crate::error::OutboxError::from)?;
            if messages.is_empty() {
                continue;
            }

            let mut records = Vec::with_capacity(messages.len());
            for message in &messages {
                match serde_json::from_slice::<OutboxRecord>(&message.value) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "poison CDC record, routing to DLQ");
                        let _ = self
                            .broker
                            .publish_to_dlq(&topic, &message.key, message.value.clone(), &e.to_string())
                            .await;
                    }
                }
            }

            if !records.is_empty() {
                match self.flush_bulk(&records).await {
                    Ok(n) => tracing::debug!(topic = %topic, indexed = n, "cdc batch indexed"),
                    Err(e) => {
                        tracing::error!(topic = %topic, error = %e, "indexing batch failed after retry, routing to DLQ");
                        for record in &records {
                            let value = serde_json::to_vec(record).unwrap_or_default();
                            let _ = self
                                .broker
                                .publish_to_dlq(&topic, &record.aggregate_id, value, &e.to_string())
                                .await;
                        }
                    }
                }
            }

            self.broker
                .commit(&topic, messages.len())
                .await
                .map_err(crate::error::OutboxError::from)?;
            if let Some(last_id) = records.iter().map(|r| r.id).max() {
                self.advance_checkpoint(&topic, last_id).await?;
            }
            total += messages.len();
        }
        Ok(total)
    }

    /// Consumer loop: polls every CDC topic until `cancel` fires, sleeping
    /// between empty polls so an idle pipeline doesn't spin.
    pub async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
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
                Ok(n) => tracing::debug!(processed = n, "indexer batch processed"),
                Err(e) => {
                    tracing::error!(error = %e, "indexer poll failed, backing off");
                    tokio::time::sleep(self.config.poll_interval * 2).await;
                }
            }
        }
    }

    /// Idempotently creates or updates the index mappings the pipeline
    /// writes into. Safe to call on every startup.
    pub async fn ensure_indices(&self) -> Result<(), IndexError> {
        for (index, mapping) in [
            ("learners", learner_mapping()),
            ("lessons", lesson_mapping()),
            ("assessments", assessment_mapping()),
        ] {
            let url = format!("{}/{}", self.config.search_base_url, index);
            let resp = self.http.put(&url).json(&mapping).send().await;
            if let Ok(resp) = resp {
                if !resp.status().is_success() && resp.status().as_u16() != 400 {
                    tracing::warn!(index, status = %resp.status(), "index mapping creation returned non-success");
                }
            }
        }
        Ok(())
    }

    fn build_op(record: &OutboxRecord) -> Option<(Value, Option<Value>)> {
        let index = index_name_for(&record.aggregate_type);
        if record.event_type.eq_ignore_ascii_case("DELETE") {
            return Some((json!({"delete": {"_index": index, "_id": record.aggregate_id}}), None));
        }

        let fields = Transformer::transform(record)?;
        // The search index serves teacher/guardian-facing lookups; admin tooling
        // reads the relational store directly, so admin-only fields must still be
        // masked here rather than leaking into the shared index.
        let caller_roles: HashSet<String> = ["teacher", "guardian"].iter().map(|s| s.to_string()).collect();
        let intended_audience: HashSet<String> = ["teacher", "admin", "guardian"].iter().map(|s| s.to_string()).collect();
        let outcome = AccessFilter::filter(&record.aggregate_type, fields, &caller_roles, &intended_audience)?;

        let mut doc = serde_json::Map::new();
        doc.insert("id".into(), json!(record.aggregate_id));
        doc.insert("tenant_id".into(), json!(record.event_data.get("tenant_id").cloned().unwrap_or(Value::Null)));
        doc.insert("visible_to_roles".into(), json!(outcome.visible_to_roles));
        doc.insert("data_sensitivity".into(), json!(format!("{:?}", outcome.data_sensitivity).to_lowercase()));
        doc.insert("restricted_fields".into(), json!(outcome.restricted_fields));
        for (k, v) in outcome.fields {
            doc.insert(k, v);
        }

        Some((
            json!({"index": {"_index": index, "_id": record.aggregate_id}}),
            Some(Value::Object(doc)),
        ))
    }

    /// Builds an NDJSON bulk body for a batch of outbox records.
    pub fn build_bulk_body(records: &[OutboxRecord]) -> (String, usize) {
        let mut body = String::new();
        let mut skipped = 0;
        for record in records {
            match Self::build_op(record) {
                Some((action, Some(doc))) => {
                    body.push_str(&action.to_string());
                    body.push('\n');
                    body.push_str(&doc.to_string());
                    body.push('\n');
                }
                Some((action, None)) => {
                    body.push_str(&action.to_string());
                    body.push('\n');
                }
                None => skipped += 1,
            }
        }
        (body, skipped)
    }

    pub async fn flush_bulk(&self, records: &[OutboxRecord]) -> Result<usize, IndexError> {
        let (body, skipped) = Self::build_bulk_body(records);
        if body.is_empty() {
            return Ok(0);
        }
        let url = format!("{}/_bulk", self.config.search_base_url);
        let resp = self
            .http
            .post(&url)
            .header("content-type", "application/x-ndjson")
            .body(body.clone())
            .send()
            .await?;

        if !resp.status().is_success() {
            return self.retry_split(records).await;
        }

        let body: Value = resp.json().await.unwrap_or(json!({}));
        let errored = body
            .get("items")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter(|item| {
                        item.as_object()
                            .and_then(|obj| obj.values().next())
                            .and_then(|v| v.get("error"))
                            .is_some()
                    })
                    .count()
            })
            .unwrap_or(0);

        if errored > 0 {
            tracing::warn!(errored, "bulk write carried item errors, retrying once");
            return self.retry_split(records).await;
        }

        metrics::increment_counter!("index_ops_total", "count" => (records.len() - skipped).to_string());
        metrics::increment_counter!("index_skipped_total", "count" => skipped.to_string());
        Ok(records.len() - skipped)
    }

    /// Splits a failed batch in half and retries once before surfacing a
    /// partial-failure error for the caller to route to DLQ.
    async fn retry_split(&self, records: &[OutboxRecord]) -> Result<usize, IndexError> {
        if records.len() <= 1 {
            return Err(IndexError::PartialFailure { failed: records.len() });
        }
        let mid = records.len() / 2;
        let (left, right) = records.split_at(mid);
        let mut ok = 0;
        let mut failed = 0;
        for half in [left, right] {
            let (body, _) = Self::build_bulk_body(half);
            if body.is_empty() {
                continue;
            }
            let url = format!("{}/_bulk", self.config.search_base_url);
            match self.http.post(&url).header("content-type", "application/x-ndjson").body(body).send().await {
                Ok(resp) if resp.status().is_success() => ok += half.len(),
                _ => failed += half.len(),
            }
        }
        if failed > 0 {
            return Err(IndexError::PartialFailure { failed });
        }
        Ok(ok)
    }
}

fn learner_mapping() -> Value {
    json!({
        "settings": { "analysis": { "analyzer": { "subject_analyzer": { "type": "standard" } } } },
        "mappings": {
            "properties": {
                "id": {"type": "keyword"},
                "tenant_id": {"type": "keyword"},
                "visible_to_roles": {"type": "keyword"},
                "data_sensitivity": {"type": "keyword"},
                "search_text": {"type": "text", "analyzer": "standard"},
                "name_suggest": {"type": "completion"},
                "updated_at": {"type": "date"},
            }
        }
    })
}

fn lesson_mapping() -> Value {
    json!({
        "settings": { "analysis": { "analyzer": { "subject_analyzer": { "type": "standard" }, "edge_ngram_analyzer": { "type": "custom", "tokenizer": "standard", "filter": ["lowercase"] } } } },
        "mappings": {
            "properties": {
                "id": {"type": "keyword"},
                "subject": {"type": "keyword"},
                "search_text": {"type": "text", "analyzer": "subject_analyzer"},
                "title_suggest": {"type": "completion"},
                "updated_at": {"type": "date"},
            }
        }
    })
}

fn assessment_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": {"type": "keyword"},
                "search_text": {"type": "text"},
                "updated_at": {"type": "date"},
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn record(event_type: &str, data: Value) -> OutboxRecord {
        OutboxRecord {
            id: 1,
            aggregate_type: "learner".into(),
            aggregate_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            event_data: data,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn delete_event_builds_delete_op_with_no_document() {
        let rec = record("DELETE", json!({}));
        let (action, doc) = Indexer::build_op(&rec).unwrap();
        assert!(action["delete"].is_object());
        assert!(doc.is_none());
    }

    #[test]
    fn update_event_builds_index_op_with_filtered_document() {
        let rec = record("UPDATE", json!({"name": "Jo Smith", "ssn": "123-45-6789"}));
        let (action, doc) = Indexer::build_op(&rec).unwrap();
        assert!(action["index"].is_object());
        let doc = doc.unwrap();
        assert!(!doc.as_object().unwrap().contains_key("ssn"));
    }
}
