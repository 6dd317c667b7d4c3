//! HTTP ingestion endpoint (C3): validates, decompresses, and forwards
//! batches of events to the broker, falling back to the disk spool on
//! outage and routing rejects to the dead-letter topic.

use crate::broker::BrokerClient;
use crate::config::CollectorConfig;
use crate::error::CollectorError;
use crate::middleware::logging::request_logging;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimitLayer};
use crate::model::{raw_event_id, Event, EventBatch, EventBatchRequest, EventBatchResponse};
use crate::spool::DiskSpool;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

pub struct CollectorStats {
    pub events_processed_total: AtomicU64,
    pub kafka_writes_total: AtomicU64,
    pub dlq_events_total: AtomicU64,
    pub start_time: Instant,
}

impl Default for CollectorStats {
    fn default() -> Self {
        Self {
            events_processed_total: AtomicU64::new(0),
            kafka_writes_total: AtomicU64::new(0),
            dlq_events_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }
}

pub struct CollectorState {
    pub broker: Arc<dyn BrokerClient>,
    pub spool: Arc<DiskSpool>,
    pub config: CollectorConfig,
    pub stats: CollectorStats,
}

pub fn router(state: Arc<CollectorState>) -> Router {
    let rate_limiter = RateLimitLayer::new(state.config.rate_limit.clone());
    Router::new()
        .route("/collect", post(collect))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn_with_state(rate_limiter, rate_limit_middleware))
        .layer(from_fn(request_logging))
        .with_state(state)
}

fn decode_body(headers: &HeaderMap, body: Bytes, max_bytes: usize) -> Result<Vec<u8>, CollectorError> {
    let is_gzip = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false);

    let decoded = if is_gzip {
        let mut decoder = flate2::read::GzDecoder::new(&body[..]);
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CollectorError::BadRequest(format!("invalid gzip body: {e}")))?;
        out
    } else {
        body.to_vec()
    };

    if decoded.len() > max_bytes {
        return Err(CollectorError::BodyTooLarge { max_bytes });
    }
    Ok(decoded)
}

fn validate_event(event: &Event, cfg: &CollectorConfig) -> Result<(), String> {
    let now = Utc::now();
    if event.timestamp > now + cfg.max_future_skew {
        return Err("timestamp cannot be more than 5 minutes in the future".to_string());
    }
    if now.signed_duration_since(event.timestamp).to_std().unwrap_or_default() > cfg.max_past_age {
        return Err("timestamp is older than the maximum retention window".to_string());
    }
    if event.source_service.trim().is_empty() {
        return Err("source_service is required".to_string());
    }
    let data_len = serde_json::to_vec(&event.event_data).map(|v| v.len()).unwrap_or(0);
    if data_len > cfg.max_event_data_bytes {
        return Err(format!("event_data exceeds maximum size of {} bytes", cfg.max_event_data_bytes));
    }
    Ok(())
}

fn partition_hint(learner_id: &Uuid, partitions: i32) -> i32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    use std::hash::{Hash, Hasher};
    learner_id.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as i32
}

async fn collect(
    State(state): State<Arc<CollectorState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();

    if body.len() > state.config.max_body_bytes {
        return status_error(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }

    let decoded = match decode_body(&headers, body, state.config.max_body_bytes) {
        Ok(d) => d,
        Err(CollectorError::BodyTooLarge { .. }) => {
            return status_error(StatusCode::PAYLOAD_TOO_LARGE, "decompressed body too large")
        }
        Err(e) => return status_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let request: EventBatchRequest = match serde_json::from_slice(&decoded) {
        Ok(r) => r,
        Err(e) => return status_error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {e}")),
    };

    if request.events().len() > state.config.max_batch_events {
        return status_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("batch cannot contain more than {} events", state.config.max_batch_events),
        );
    }
    if request.events().is_empty() {
        return status_error(StatusCode::UNPROCESSABLE_ENTITY, "event batch cannot be empty");
    }

    let batch_id = request.batch_id().unwrap_or_else(Uuid::new_v4);
    let raw_events = request.into_events();

    let mut valid_events = Vec::with_capacity(raw_events.len());
    let mut rejected: Vec<Uuid> = Vec::new();
    let mut warnings = Vec::new();

    for raw in raw_events {
        let event: Event = match serde_json::from_value(raw.clone()) {
            Ok(e) => e,
            Err(e) => {
                let event_id = raw_event_id(&raw);
                tracing::warn!(event_id = %event_id, reason = %e, "event rejected: unrecognized shape or event_type");
                state.stats.dlq_events_total.fetch_add(1, Ordering::Relaxed);
                rejected.push(event_id);
                continue;
            }
        };
        match validate_event(&event, &state.config) {
            Ok(()) => valid_events.push(event),
            Err(reason) => {
                tracing::warn!(event_id = %event.event_id, reason = %reason, "event rejected by validation");
                state.stats.dlq_events_total.fetch_add(1, Ordering::Relaxed);
                rejected.push(event.event_id);
            }
        }
    }

    if valid_events.is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(EventBatchResponse {
                batch_id,
                accepted_count: 0,
                rejected_count: rejected.len(),
                processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
                kafka_partition: None,
                dlq_events: rejected,
                warnings,
            }),
        )
            .into_response();
    }

    let healthy = state.broker.health_check().await;
    let accepted_count = valid_events.len();
    let partition = valid_events
        .first()
        .map(|e| partition_hint(&e.learner_id, 3));

    if healthy {
        let mut publish_failed = false;
        for event in &valid_events {
            let value = match serde_json::to_vec(event) {
                Ok(v) => v,
                Err(_) => {
                    publish_failed = true;
                    break;
                }
            };
            let critical = matches!(event.priority, crate::model::EventPriority::Critical);
            let key = event.learner_id.to_string();
            let result = state.broker.publish(&state.config.events_topic, &key, value.clone()).await;
            match result {
                Ok(()) => {
                    state.stats.kafka_writes_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::error!(error = %e, "publish failed");
                    let _ = state
                        .broker
                        .publish_to_dlq(&state.config.events_topic, &key, value, &e.to_string())
                        .await;
                    state.stats.dlq_events_total.fetch_add(1, Ordering::Relaxed);
                    if critical {
                        publish_failed = true;
                    }
                }
            }
        }
        if publish_failed {
            warnings.push("one or more critical events failed publish confirmation".to_string());
        }
    } else {
        let batch = EventBatch { batch_id, events: valid_events.clone() };
        match state.spool.write_batch(&batch) {
            Ok(_) => warnings.push("buffered to disk".to_string()),
            Err(e) => {
                tracing::error!(error = %e, "spool write failed, rejecting batch");
                for ev in &valid_events {
                    rejected.push(ev.event_id);
                }
                return status_error(StatusCode::SERVICE_UNAVAILABLE, "broker unreachable and spool write failed");
            }
        }
    }

    state.stats.events_processed_total.fetch_add(accepted_count as u64, Ordering::Relaxed);

    let status = if rejected.is_empty() { StatusCode::OK } else { StatusCode::MULTI_STATUS };
    (
        status,
        Json(EventBatchResponse {
            batch_id,
            accepted_count,
            rejected_count: rejected.len(),
            processing_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            kafka_partition: partition,
            dlq_events: rejected,
            warnings,
        }),
    )
        .into_response()
}

fn status_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error_code": format!("HTTP_{}", status.as_u16()),
            "error_message": message,
            "timestamp": Utc::now().timestamp(),
        })),
    )
        .into_response()
}

async fn health(State(state): State<Arc<CollectorState>>) -> Response {
    let kafka_connected = state.broker.health_check().await;
    Json(json!({
        "status": "healthy",
        "kafka_connected": kafka_connected,
        "buffer_status": { "pending_segments": state.spool.pending_count() },
        "uptime_seconds": state.stats.start_time.elapsed().as_secs_f64(),
    }))
    .into_response()
}

async fn metrics(State(state): State<Arc<CollectorState>>) -> Response {
    Json(json!({
        "events_processed_total": state.stats.events_processed_total.load(Ordering::Relaxed),
        "kafka_writes_total": state.stats.kafka_writes_total.load(Ordering::Relaxed),
        "dlq_events_total": state.stats.dlq_events_total.load(Ordering::Relaxed),
        "buffer_events_count": state.spool.pending_count(),
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::model::EventType;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::Request;
    use std::net::SocketAddr;
    use tower::ServiceExt;

    fn with_peer(mut req: Request<Body>) -> Request<Body> {
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4000))));
        req
    }

    fn sample_event(learner: Uuid) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            learner_id: learner,
            tenant_id: Uuid::new_v4(),
            event_type: EventType::Interaction,
            timestamp: Utc::now(),
            priority: crate::model::EventPriority::Normal,
            session_id: None,
            game_id: None,
            source_service: "game-client".into(),
            event_data: json!({"x": 1}),
            metadata: Default::default(),
        }
    }

    fn test_state() -> Arc<CollectorState> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(CollectorState {
            broker: InMemoryBroker::new(),
            spool: Arc::new(DiskSpool::new(dir.path(), std::time::Duration::from_secs(1800)).unwrap()),
            config: CollectorConfig::default(),
            stats: CollectorStats::default(),
        })
    }

    #[tokio::test]
    async fn accepts_a_valid_batch() {
        let state = test_state();
        let app = router(state);
        let batch = json!({ "events": [sample_event(Uuid::new_v4())] });
        let resp = app
            .oneshot(with_peer(
                Request::post("/collect")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&batch).unwrap()))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_batch_over_limit() {
        let mut state = test_state();
        Arc::get_mut(&mut state).unwrap().config.max_batch_events = 1;
        let app = router(state);
        let batch = json!({ "events": [sample_event(Uuid::new_v4()), sample_event(Uuid::new_v4())] });
        let resp = app
            .oneshot(with_peer(
                Request::post("/collect")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&batch).unwrap()))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn falls_back_to_spool_when_broker_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let broker = InMemoryBroker::new();
        broker.set_healthy(false);
        let state = Arc::new(CollectorState {
            broker: broker.clone(),
            spool: Arc::new(DiskSpool::new(dir.path(), std::time::Duration::from_secs(1800)).unwrap()),
            config: CollectorConfig::default(),
            stats: CollectorStats::default(),
        });
        let app = router(state.clone());
        let batch = json!({ "events": [sample_event(Uuid::new_v4())] });
        let resp = app
            .oneshot(with_peer(
                Request::post("/collect")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&batch).unwrap()))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.spool.pending_count(), 1);
    }

    #[tokio::test]
    async fn one_bad_event_type_rejects_only_that_event() {
        let state = test_state();
        let app = router(state);
        let good = serde_json::to_value(sample_event(Uuid::new_v4())).unwrap();
        let mut bad = serde_json::to_value(sample_event(Uuid::new_v4())).unwrap();
        bad["event_type"] = json!("not_a_real_event_type");
        let batch = json!({ "events": [good, bad] });

        let resp = app
            .oneshot(with_peer(
                Request::post("/collect")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&batch).unwrap()))
                    .unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::MULTI_STATUS);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["accepted_count"], 1);
        assert_eq!(parsed["rejected_count"], 1);
    }
}
