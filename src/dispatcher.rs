//! Delivers outbound actions to downstream services with retries and a
//! per-target circuit breaker, the same open/half-open/closed shape used
//! elsewhere in this codebase to guard against a persistently failing
//! endpoint (C10).

use crate::broker::BrokerClient;
use crate::config::DispatcherConfig;
use crate::error::DispatchError;
use crate::model::{ActionType, OutboundAction};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::{BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
    }

    fn allow_request(&mut self, cooldown: Duration) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| Utc::now().signed_duration_since(at).to_std().unwrap_or_default())
                    .unwrap_or_default();
                if elapsed >= cooldown {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, threshold: u32) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(Utc::now());
        }
    }
}

fn is_retryable(status: reqwest::StatusCode) -> bool {
    status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429
}

const ACTIONS_DLQ_TOPIC: &str = "actions.dlq";

/// An action held until its `not_before` time, ordered earliest-first so the
/// delay queue always pops the next action due.
struct DelayedAction {
    not_before: DateTime<Utc>,
    action: OutboundAction,
}

impl PartialEq for DelayedAction {
    fn eq(&self, other: &Self) -> bool {
        self.not_before == other.not_before
    }
}
impl Eq for DelayedAction {}
impl PartialOrd for DelayedAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.not_before.cmp(&other.not_before)
    }
}

pub struct ActionDispatcher {
    http: reqwest::Client,
    config: DispatcherConfig,
    breakers: RwLock<HashMap<String, CircuitBreaker>>,
    broker: Arc<dyn BrokerClient>,
    delayed: AsyncMutex<BinaryHeap<Reverse<DelayedAction>>>,
}

impl ActionDispatcher {
    pub fn new(config: DispatcherConfig, broker: Arc<dyn BrokerClient>) -> Self {
        let http = reqwest::Client::builder().timeout(config.request_timeout).build().unwrap_or_default();
        Self {
            http,
            config,
            breakers: RwLock::new(HashMap::new()),
            broker,
            delayed: AsyncMutex::new(BinaryHeap::new()),
        }
    }

    /// Routes a terminally-failed action to `actions.dlq` carrying the full
    /// envelope and the failure that caused it to give up.
    async fn route_to_dlq(&self, action: &OutboundAction, failure: &DispatchError) {
        let envelope = json!({
            "action": action,
            "failure": failure.to_string(),
            "failed_at": Utc::now(),
        });
        let value = serde_json::to_vec(&envelope).unwrap_or_default();
        if let Err(e) = self
            .broker
            .publish(ACTIONS_DLQ_TOPIC, &action.learner_id.to_string(), value)
            .await
        {
            tracing::error!(action_id = %action.action_id, error = %e, "failed to route action to actions.dlq");
        }
    }

    /// Enqueues an action for delivery: delayed into the time-ordered queue
    /// if `not_before` is in the future, dispatched immediately otherwise.
    /// Terminal failures are routed to the actions DLQ.
    pub async fn enqueue(&self, action: OutboundAction) {
        if let Some(not_before) = action.not_before {
            if not_before > Utc::now() {
                self.delayed.lock().await.push(Reverse(DelayedAction { not_before, action }));
                return;
            }
        }
        self.dispatch_or_dlq(action).await;
    }

    async fn dispatch_or_dlq(&self, action: OutboundAction) {
        if let Err(e) = self.dispatch(&action).await {
            tracing::warn!(action_id = %action.action_id, error = %e, "action delivery failed terminally");
            self.route_to_dlq(&action, &e).await;
        }
    }

    /// Pops and dispatches every delayed action whose `not_before` has
    /// arrived. Call periodically from the orchestrator's loop.
    pub async fn drain_due(&self) {
        let due = {
            let mut queue = self.delayed.lock().await;
            let mut due = Vec::new();
            while let Some(Reverse(head)) = queue.peek() {
                if head.not_before > Utc::now() {
                    break;
                }
                let Reverse(item) = queue.pop().unwrap();
                due.push(item.action);
            }
            due
        };
        for action in due {
            self.dispatch_or_dlq(action).await;
        }
    }

    fn target_url(&self, action: &OutboundAction) -> String {
        match action.action_type {
            ActionType::LevelSuggested => {
                format!("{}/api/v1/learners/{}/level", self.config.learner_service_url, action.learner_id)
            }
            ActionType::LearningPathUpdate => {
                format!("{}/api/v1/learners/{}/learning-path", self.config.learner_service_url, action.learner_id)
            }
            ActionType::GameBreak | ActionType::SelIntervention => {
                format!("{}/internal/broadcast", self.config.notification_service_url)
            }
        }
    }

    fn http_method(&self, action: &OutboundAction) -> reqwest::Method {
        match action.action_type {
            ActionType::LevelSuggested | ActionType::LearningPathUpdate => reqwest::Method::PUT,
            ActionType::GameBreak | ActionType::SelIntervention => reqwest::Method::POST,
        }
    }

    fn circuit_allows(&self, target: &str) -> bool {
        let mut breakers = self.breakers.write();
        breakers
            .entry(target.to_string())
            .or_insert_with(CircuitBreaker::new)
            .allow_request(self.config.circuit_cooldown)
    }

    fn record_outcome(&self, target: &str, success: bool) {
        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(target.to_string()).or_insert_with(CircuitBreaker::new);
        if success {
            breaker.record_success();
        } else {
            breaker.record_failure(self.config.circuit_failure_threshold);
        }
    }

    pub fn circuit_state(&self, target: &str) -> Option<CircuitState> {
        self.breakers.read().get(target).map(|b| b.state)
    }

    /// Sends one action with exponential backoff, classifying 4xx (except
    /// 408/429) as terminal and everything else retryable up to
    /// `max_attempts`.
    pub async fn dispatch(&self, action: &OutboundAction) -> Result<(), DispatchError> {
        let url = self.target_url(action);
        let target = action.target_service.clone();

        if !self.circuit_allows(&target) {
            return Err(DispatchError::CircuitOpen { target });
        }

        let mut backoff = self.config.initial_backoff;
        let mut last_err = None;

        for attempt in 0..self.config.max_attempts {
            let request = self
                .http
                .request(self.http_method(action), &url)
                .header("Idempotency-Key", action.action_id.to_string())
                .json(&action.payload);

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    self.record_outcome(&target, true);
                    return Ok(());
                }
                Ok(resp) if is_retryable(resp.status()) => {
                    last_err = Some(DispatchError::Terminal { status: resp.status().as_u16() });
                }
                Ok(resp) => {
                    self.record_outcome(&target, false);
                    return Err(DispatchError::Terminal { status: resp.status().as_u16() });
                }
                Err(e) => {
                    last_err = Some(DispatchError::Request(e));
                }
            }

            if attempt + 1 < self.config.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
        }

        self.record_outcome(&target, false);
        Err(last_err.unwrap_or(DispatchError::CircuitOpen { target }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new();
        for _ in 0..5 {
            breaker.record_failure(5);
        }
        assert_eq!(breaker.state, CircuitState::Open);
    }

    #[test]
    fn breaker_closes_on_success() {
        let mut breaker = CircuitBreaker::new();
        breaker.record_failure(5);
        breaker.record_success();
        assert_eq!(breaker.state, CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures, 0);
    }

    #[test]
    fn retryable_status_classification() {
        assert!(is_retryable(reqwest::StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_retryable(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(reqwest::StatusCode::REQUEST_TIMEOUT));
        assert!(!is_retryable(reqwest::StatusCode::BAD_REQUEST));
        assert!(!is_retryable(reqwest::StatusCode::FORBIDDEN));
    }
}
