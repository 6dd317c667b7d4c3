//! Background task that retries spooled batches once the broker recovers
//! (C1's sweeper half): drains [`DiskSpool`] in FIFO order and republishes
//! each batch's events the same way the collector publishes a live batch,
//! deleting the segment once every event in it is confirmed.

use crate::broker::BrokerClient;
use crate::config::CollectorConfig;
use crate::spool::DiskSpool;
use std::sync::Arc;
use std::time::Duration;

pub struct SpoolSweeper {
    broker: Arc<dyn BrokerClient>,
    spool: Arc<DiskSpool>,
    config: CollectorConfig,
    interval: Duration,
}

impl SpoolSweeper {
    pub fn new(broker: Arc<dyn BrokerClient>, spool: Arc<DiskSpool>, config: CollectorConfig, interval: Duration) -> Self {
        Self { broker, spool, config, interval }
    }

    /// Republishes every pending segment, oldest first, stopping at the
    /// first segment that fails so later segments aren't republished ahead
    /// of an earlier one still stuck on disk.
    pub async fn sweep_once(&self) -> usize {
        if !self.broker.health_check().await {
            return 0;
        }
        let segments = match self.spool.read_batches() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "spool sweep failed to list segments");
                return 0;
            }
        };

        let mut recovered = 0;
        for (segment, batch) in segments {
            let mut all_published = true;
            for event in &batch.events {
                let value = match serde_json::to_vec(event) {
                    Ok(v) => v,
                    Err(_) => {
                        all_published = false;
                        break;
                    }
                };
                let key = event.learner_id.to_string();
                if let Err(e) = self.broker.publish(&self.config.events_topic, &key, value).await {
                    tracing::warn!(error = %e, batch_id = %segment.batch_id, "sweep republish failed, will retry next sweep");
                    all_published = false;
                    break;
                }
            }

            if all_published {
                if let Err(e) = self.spool.remove_batch(&segment) {
                    tracing::error!(error = %e, batch_id = %segment.batch_id, "failed to remove recovered spool segment");
                } else {
                    recovered += 1;
                }
            } else {
                break;
            }
        }
        recovered
    }

    pub async fn run(&self, mut cancel: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *cancel.borrow() {
                return;
            }
            let recovered = self.sweep_once().await;
            if recovered > 0 {
                tracing::info!(recovered, "spool sweeper recovered buffered batches");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = cancel.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::model::{Event, EventBatch, EventPriority, EventType};
    use chrono::Utc;
    use uuid::Uuid;

    fn sample_event() -> Event {
        Event {
            event_id: Uuid::new_v4(),
            learner_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            event_type: EventType::Interaction,
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            session_id: None,
            game_id: None,
            source_service: "test".into(),
            event_data: serde_json::json!({}),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn sweep_republishes_and_removes_segment_once_broker_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let spool = Arc::new(DiskSpool::new(dir.path(), Duration::from_secs(3600)).unwrap());
        let batch = EventBatch { batch_id: Uuid::new_v4(), events: vec![sample_event()] };
        spool.write_batch(&batch).unwrap();

        let broker = InMemoryBroker::new();
        broker.set_healthy(false);
        let config = CollectorConfig::default();
        let sweeper = SpoolSweeper::new(broker.clone(), spool.clone(), config.clone(), Duration::from_millis(10));

        assert_eq!(sweeper.sweep_once().await, 0);
        assert_eq!(spool.pending_count(), 1);

        broker.set_healthy(true);
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(spool.pending_count(), 0);

        let published = broker.poll(&config.events_topic, 10).await.unwrap();
        assert_eq!(published.len(), 1);
    }
}
