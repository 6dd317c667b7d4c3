//! Stateful adaptive-difficulty and intervention rules (C9).
//!
//! Pure function: `(event, LearnerState) -> (LearnerState', [OutboundAction])`.
//! All wall-clock reads go through an injected [`Clock`] so evaluation stays
//! deterministic in tests.

use crate::config::RulesConfig;
use crate::model::{
    ActionType, AssessmentEntry, Event, EventType, LearnerLevel, LearnerState, OutboundAction,
    SelAlertEntry,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RulesEngine<'a> {
    config: &'a RulesConfig,
    clock: &'a dyn Clock,
}

fn f64_field(data: &Value, key: &str) -> Option<f64> {
    data.get(key).and_then(|v| v.as_f64())
}

fn str_field<'v>(data: &'v Value, key: &str) -> Option<&'v str> {
    data.get(key).and_then(|v| v.as_str())
}

/// Idempotency-key namespace for [`action_id`]. Fixed so the same logical
/// action bucketed to the same minute always hashes to the same id, even
/// across process restarts.
const ACTION_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x4c, 0x65, 0x61, 0x72, 0x6e, 0x4c, 0x6f, 0x6f, 0x70, 0x41, 0x63, 0x74, 0x69, 0x6f, 0x6e, 0x00,
]);

/// `action_id` is a stable idempotency key: a hash of
/// `(learner_id, action_type, bucketed_time)`. Bucketing to the minute means
/// a redelivered event that re-derives the identical action collapses onto
/// the same key at the downstream target instead of firing a duplicate.
fn action_id(learner_id: Uuid, action_type: ActionType, now: DateTime<Utc>) -> Uuid {
    let bucket = now.timestamp() / 60;
    let name = format!("{learner_id}:{action_type:?}:{bucket}");
    Uuid::new_v5(&ACTION_ID_NAMESPACE, name.as_bytes())
}

fn action(
    action_type: ActionType,
    target_service: &str,
    state: &LearnerState,
    payload: Value,
    now: DateTime<Utc>,
) -> OutboundAction {
    OutboundAction {
        action_id: action_id(state.learner_id, action_type, now),
        action_type,
        target_service: target_service.to_string(),
        learner_id: state.learner_id,
        tenant_id: state.tenant_id,
        payload,
        created_at: now,
        not_before: None,
    }
}

impl<'a> RulesEngine<'a> {
    pub fn new(config: &'a RulesConfig, clock: &'a dyn Clock) -> Self {
        Self { config, clock }
    }

    /// Returns `None` when `event.event_id` matches `state.last_applied_event_id`,
    /// i.e. this is a redelivery of an event already applied.
    pub fn process(&self, event: &Event, state: &mut LearnerState) -> Option<Vec<OutboundAction>> {
        if state.last_applied_event_id == Some(event.event_id) {
            return None;
        }

        let now = self.clock.now();
        let mut actions = Vec::new();
        let mut level_decided = false;

        match event.event_type {
            EventType::BaselineComplete => {
                self.handle_baseline_complete(event, state, now, &mut actions);
                level_decided = true;
            }
            EventType::SlpUpdated => {
                self.handle_slp_updated(event, state, now, &mut actions);
                level_decided = !actions.is_empty();
            }
            EventType::SelAlert => {
                self.handle_sel_alert(event, state, now, &mut actions);
            }
            EventType::CourseworkAnalyzed => {
                self.handle_coursework_analyzed(event, state);
            }
            EventType::AssessmentComplete => {
                self.handle_assessment_complete(event, state);
            }
            EventType::LearnerProgress => {
                self.handle_learner_progress(event, state);
            }
            EventType::EngagementLow => {
                self.handle_engagement_low(event, state, now, &mut actions);
                level_decided = true;
            }
            _ => {}
        }

        if !level_decided {
            self.check_level_adjustment(state, now, &mut actions);
        }

        self.check_universal_actions(state, now, &mut actions);

        state.last_applied_event_id = Some(event.event_id);
        Some(actions)
    }

    fn handle_baseline_complete(
        &self,
        event: &Event,
        state: &mut LearnerState,
        now: DateTime<Utc>,
        actions: &mut Vec<OutboundAction>,
    ) {
        let overall_score = f64_field(&event.event_data, "overall_score").unwrap_or(state.performance_score);
        state.baseline_established = true;
        state.performance_score = overall_score;

        let new_level = LearnerLevel::from_baseline_score(overall_score);
        if new_level != state.current_level {
            actions.push(action(
                ActionType::LevelSuggested,
                "learner-service",
                state,
                json!({"suggested_level": new_level, "reason": "baseline assessment", "confidence": 0.9}),
                now,
            ));
            state.current_level = new_level;
        }

        actions.push(action(
            ActionType::LearningPathUpdate,
            "learner-service",
            state,
            json!({
                "strengths": event.event_data.get("strengths").cloned().unwrap_or(Value::Array(vec![])),
                "challenges": event.event_data.get("challenges").cloned().unwrap_or(Value::Array(vec![])),
                "focus": event.event_data.get("focus").cloned().unwrap_or(Value::Null),
            }),
            now,
        ));
    }

    fn handle_slp_updated(
        &self,
        event: &Event,
        state: &mut LearnerState,
        now: DateTime<Utc>,
        actions: &mut Vec<OutboundAction>,
    ) {
        let communication_score = f64_field(&event.event_data, "communication_score").unwrap_or(1.0);
        if communication_score < 0.40 && state.current_level != LearnerLevel::Beginner && state.current_level != LearnerLevel::Easy {
            let stepped = state.current_level.step_down();
            actions.push(action(
                ActionType::LevelSuggested,
                "learner-service",
                state,
                json!({"suggested_level": stepped, "reason": "speech-language support update", "confidence": 0.75}),
                now,
            ));
            state.current_level = stepped;
        }
    }

    fn handle_sel_alert(
        &self,
        event: &Event,
        state: &mut LearnerState,
        now: DateTime<Utc>,
        actions: &mut Vec<OutboundAction>,
    ) {
        let severity = str_field(&event.event_data, "severity").unwrap_or("moderate").to_string();
        state.recent_sel_alerts.push_back(SelAlertEntry { at: now, severity: severity.clone() });

        let window_start = now - chrono::Duration::hours(1);
        let count_in_window = state.recent_sel_alerts.iter().filter(|e| e.at >= window_start).count();

        if count_in_window >= self.config.sel_alerts_threshold || severity == "high" {
            let urgency = if severity == "high" { "high" } else { "moderate" };
            actions.push(action(
                ActionType::SelIntervention,
                "notification-service",
                state,
                json!({"urgency": urgency, "message": sel_message(&severity)}),
                now,
            ));
            actions.push(action(
                ActionType::GameBreak,
                "notification-service",
                state,
                json!({"break_type": "mindfulness", "duration_minutes": 5}),
                now,
            ));
        }
    }

    fn handle_coursework_analyzed(&self, event: &Event, state: &mut LearnerState) {
        if let Some(accuracy) = f64_field(&event.event_data, "accuracy") {
            state.performance_score = accuracy;
            if accuracy >= 0.80 {
                state.consecutive_correct += 1;
                state.consecutive_incorrect = 0;
            } else if accuracy <= 0.40 {
                state.consecutive_incorrect += 1;
                state.consecutive_correct = 0;
            } else {
                state.consecutive_correct = 0;
                state.consecutive_incorrect = 0;
            }
        }
        if let Some(engagement) = f64_field(&event.event_data, "engagement") {
            state.engagement_score = engagement;
        }
        if let Some(duration) = f64_field(&event.event_data, "session_duration") {
            state.session_duration_minutes += duration;
        }
    }

    fn handle_assessment_complete(&self, event: &Event, state: &mut LearnerState) {
        let score = f64_field(&event.event_data, "score").unwrap_or(state.performance_score);
        state.recent_assessments.push_back(AssessmentEntry { at: self.clock.now(), score });
        let last_three: Vec<f64> = state.recent_assessments.iter().rev().take(3).map(|e| e.score).collect();
        if !last_three.is_empty() {
            state.performance_score = last_three.iter().sum::<f64>() / last_three.len() as f64;
        }
    }

    fn handle_learner_progress(&self, event: &Event, state: &mut LearnerState) {
        if let Some(p) = f64_field(&event.event_data, "performance_score") {
            state.performance_score = p;
        }
        if let Some(e) = f64_field(&event.event_data, "engagement_score") {
            state.engagement_score = e;
        }
    }

    fn handle_engagement_low(
        &self,
        event: &Event,
        state: &mut LearnerState,
        now: DateTime<Utc>,
        actions: &mut Vec<OutboundAction>,
    ) {
        let _ = event;
        actions.push(action(
            ActionType::GameBreak,
            "notification-service",
            state,
            json!({"break_type": "energizer", "duration_minutes": 3}),
            now,
        ));
        if state.current_level != LearnerLevel::Beginner && state.current_level != LearnerLevel::Easy {
            actions.push(action(
                ActionType::LevelSuggested,
                "learner-service",
                state,
                json!({"suggested_level": "easy", "reason": "low engagement", "confidence": 0.7, "temporary": true}),
                now,
            ));
            state.current_level = LearnerLevel::Easy;
        }
    }

    fn check_level_adjustment(&self, state: &mut LearnerState, now: DateTime<Utc>, actions: &mut Vec<OutboundAction>) {
        let can_go_up = state.current_level != LearnerLevel::Advanced;
        let can_go_down = state.current_level != LearnerLevel::Beginner;

        let should_up = can_go_up
            && (state.performance_score >= self.config.level_up_perf
                || state.consecutive_correct >= self.config.streak_up);
        let should_down = can_go_down
            && (state.performance_score <= self.config.level_down_perf
                || state.consecutive_incorrect >= self.config.streak_down);

        if should_up {
            let new_level = state.current_level.step_up();
            actions.push(action(
                ActionType::LevelSuggested,
                "learner-service",
                state,
                json!({"suggested_level": new_level, "reason": "adaptive level up", "confidence": 0.80}),
                now,
            ));
            state.current_level = new_level;
        } else if should_down {
            let new_level = state.current_level.step_down();
            actions.push(action(
                ActionType::LevelSuggested,
                "learner-service",
                state,
                json!({"suggested_level": new_level, "reason": "adaptive level down", "confidence": 0.80}),
                now,
            ));
            state.current_level = new_level;
        }
    }

    fn is_break_due(&self, state: &LearnerState, now: DateTime<Utc>) -> bool {
        match state.last_break_at {
            None => true,
            Some(last) => (now - last).num_minutes() >= self.config.min_break_interval_minutes,
        }
    }

    fn check_universal_actions(&self, state: &mut LearnerState, now: DateTime<Utc>, actions: &mut Vec<OutboundAction>) {
        if state.session_duration_minutes >= self.config.max_session_minutes && self.is_break_due(state, now) {
            actions.push(action(
                ActionType::GameBreak,
                "notification-service",
                state,
                json!({"break_type": "movement", "duration_minutes": 5}),
                now,
            ));
            state.session_duration_minutes = 0.0;
            state.last_break_at = Some(now);
        } else if state.engagement_score < self.config.low_engagement && self.is_break_due(state, now) {
            actions.push(action(
                ActionType::GameBreak,
                "notification-service",
                state,
                json!({"break_type": "attention", "duration_minutes": 3}),
                now,
            ));
            state.last_break_at = Some(now);
        }
    }
}

fn sel_message(severity: &str) -> String {
    match severity {
        "high" => "Immediate check-in recommended; learner shows significant emotional distress signals.".to_string(),
        _ => "Learner shows repeated social-emotional alert signals within the last hour.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct FixedClock(DateTime<Utc>);
    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn base_event(event_type: EventType, data: Value, learner: Uuid, tenant: Uuid) -> Event {
        Event {
            event_id: Uuid::new_v4(),
            learner_id: learner,
            tenant_id: tenant,
            event_type,
            timestamp: Utc::now(),
            priority: crate::model::EventPriority::Normal,
            session_id: None,
            game_id: None,
            source_service: "test".into(),
            event_data: data,
            metadata: Default::default(),
        }
    }

    #[test]
    fn level_up_on_high_accuracy_and_streak() {
        let config = RulesConfig::default();
        let clock = FixedClock(Utc::now());
        let engine = RulesEngine::new(&config, &clock);

        let learner = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let mut state = LearnerState::new(learner, tenant);
        state.current_level = LearnerLevel::Moderate;
        state.performance_score = 0.80;
        state.consecutive_correct = 4;

        let event = base_event(
            EventType::CourseworkAnalyzed,
            json!({"accuracy": 0.90, "engagement": 0.7, "session_duration": 10.0}),
            learner,
            tenant,
        );

        let actions = engine.process(&event, &mut state).unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action_type, ActionType::LevelSuggested);
        assert_eq!(state.current_level, LearnerLevel::Challenging);
        assert_eq!(state.consecutive_correct, 5);
        assert_eq!(state.consecutive_incorrect, 0);
    }

    #[test]
    fn movement_break_when_session_duration_exceeds_threshold_and_break_due() {
        let config = RulesConfig::default();
        let now = Utc::now();
        let clock = FixedClock(now);
        let engine = RulesEngine::new(&config, &clock);

        let learner = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let mut state = LearnerState::new(learner, tenant);
        state.session_duration_minutes = 24.0;
        state.engagement_score = 0.6;
        state.last_break_at = Some(now - chrono::Duration::minutes(20));

        let event = base_event(
            EventType::CourseworkAnalyzed,
            json!({"accuracy": 0.7, "engagement": 0.6, "session_duration": 2.0}),
            learner,
            tenant,
        );

        let actions = engine.process(&event, &mut state).unwrap();
        let breaks: Vec<_> = actions.iter().filter(|a| a.action_type == ActionType::GameBreak).collect();
        assert_eq!(breaks.len(), 1);
        assert_eq!(breaks[0].payload["break_type"], "movement");
        assert_eq!(state.session_duration_minutes, 0.0);
    }

    #[test]
    fn sel_alert_escalates_on_second_alert_in_window() {
        let config = RulesConfig::default();
        let now = Utc::now();
        let clock = FixedClock(now);
        let engine = RulesEngine::new(&config, &clock);

        let learner = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let mut state = LearnerState::new(learner, tenant);
        state.recent_sel_alerts.push_back(SelAlertEntry { at: now - chrono::Duration::minutes(10), severity: "moderate".into() });

        let event = base_event(EventType::SelAlert, json!({"severity": "moderate"}), learner, tenant);
        let actions = engine.process(&event, &mut state).unwrap();

        assert!(actions.iter().any(|a| a.action_type == ActionType::SelIntervention));
        assert!(actions.iter().any(|a| a.action_type == ActionType::GameBreak && a.payload["break_type"] == "mindfulness"));
    }

    #[test]
    fn redelivered_event_id_is_a_no_op() {
        let config = RulesConfig::default();
        let clock = FixedClock(Utc::now());
        let engine = RulesEngine::new(&config, &clock);
        let learner = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let mut state = LearnerState::new(learner, tenant);
        let event = base_event(EventType::CourseworkAnalyzed, json!({"accuracy": 0.9}), learner, tenant);
        state.last_applied_event_id = Some(event.event_id);

        assert!(engine.process(&event, &mut state).is_none());
    }
}
