//! End-to-end check of the collector's HTTP surface against an in-memory
//! broker: a batch posted to `/collect` should land on the events topic
//! exactly as submitted, with the standard 200 outcome shape.

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{header, Request, StatusCode};
use learnloop_core::broker::{BrokerClient, InMemoryBroker};
use learnloop_core::collector::{self, CollectorState, CollectorStats};
use learnloop_core::config::CollectorConfig;
use learnloop_core::spool::DiskSpool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

fn with_peer(mut req: Request<Body>) -> Request<Body> {
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4001))));
    req
}

#[tokio::test]
async fn posted_batch_is_published_and_echoed_in_response() {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let spool = Arc::new(DiskSpool::new(dir.path(), Duration::from_secs(3600)).unwrap());
    let config = CollectorConfig::default();
    let events_topic = config.events_topic.clone();
    let state = Arc::new(CollectorState {
        broker: broker.clone() as Arc<dyn BrokerClient>,
        spool,
        config,
        stats: CollectorStats::default(),
    });
    let app = collector::router(state);

    let learner_id = Uuid::new_v4();
    let body = serde_json::json!({
        "events": [{
            "event_id": Uuid::new_v4(),
            "learner_id": learner_id,
            "tenant_id": Uuid::new_v4(),
            "event_type": "interaction",
            "timestamp": chrono::Utc::now(),
            "priority": "normal",
            "source_service": "integration-test",
            "event_data": {"score": 1},
        }]
    });

    let response = app
        .oneshot(with_peer(
            Request::builder()
                .method("POST")
                .uri("/collect")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["accepted_count"], 1);
    assert_eq!(parsed["rejected_count"], 0);

    let published = broker.poll(&events_topic, 10).await.unwrap();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, learner_id.to_string());
}

#[tokio::test]
async fn health_endpoint_reports_broker_status() {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    broker.set_healthy(false);
    let spool = Arc::new(DiskSpool::new(dir.path(), Duration::from_secs(3600)).unwrap());
    let state = Arc::new(CollectorState {
        broker: broker as Arc<dyn BrokerClient>,
        spool,
        config: CollectorConfig::default(),
        stats: CollectorStats::default(),
    });
    let app = collector::router(state);

    let response = app
        .oneshot(with_peer(
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        ))
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["kafka_connected"], false);
}
