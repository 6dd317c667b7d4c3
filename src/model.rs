//! Wire and internal data types shared across every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    GameStarted,
    GameCompleted,
    GamePaused,
    GameResumed,
    Interaction,
    ProgressUpdate,
    ErrorOccurred,
    SessionStart,
    SessionEnd,
    AchievementUnlocked,
    #[serde(rename = "BASELINE_COMPLETE")]
    BaselineComplete,
    #[serde(rename = "SLP_UPDATED")]
    SlpUpdated,
    #[serde(rename = "SEL_ALERT")]
    SelAlert,
    #[serde(rename = "COURSEWORK_ANALYZED")]
    CourseworkAnalyzed,
    #[serde(rename = "ASSESSMENT_COMPLETE")]
    AssessmentComplete,
    #[serde(rename = "IEP_UPDATED")]
    IepUpdated,
    #[serde(rename = "LEARNER_PROGRESS")]
    LearnerProgress,
    #[serde(rename = "ENGAGEMENT_LOW")]
    EngagementLow,
    #[serde(rename = "ACHIEVEMENT_MILESTONE")]
    AchievementMilestone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub learner_id: Uuid,
    pub tenant_id: Uuid,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: EventPriority,
    pub session_id: Option<Uuid>,
    pub game_id: Option<Uuid>,
    pub source_service: String,
    #[serde(default)]
    pub event_data: Value,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Raw events are kept as [`Value`] rather than deserialized straight into
/// [`Event`] so a single malformed or unrecognized `event_type` rejects that
/// one event instead of failing `serde_json::from_slice` for the whole
/// batch (§4.1: per-event, fail-closed validation with partial acceptance).
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EventBatchRequest {
    Wrapped {
        events: Vec<Value>,
        batch_id: Option<Uuid>,
        #[serde(default = "default_true")]
        compress: bool,
    },
    Bare(Vec<Value>),
}

fn default_true() -> bool {
    true
}

impl EventBatchRequest {
    pub fn events(&self) -> &[Value] {
        match self {
            EventBatchRequest::Wrapped { events, .. } => events,
            EventBatchRequest::Bare(events) => events,
        }
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        match self {
            EventBatchRequest::Wrapped { batch_id, .. } => *batch_id,
            EventBatchRequest::Bare(_) => None,
        }
    }

    pub fn into_events(self) -> Vec<Value> {
        match self {
            EventBatchRequest::Wrapped { events, .. } => events,
            EventBatchRequest::Bare(events) => events,
        }
    }
}

/// Best-effort extraction of `event_id` from a raw event payload that failed
/// to deserialize as a whole, so a rejected event can still be named in the
/// response's `dlq_events` list.
pub fn raw_event_id(raw: &Value) -> Uuid {
    raw.get("event_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4)
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct EventBatchResponse {
    pub batch_id: Uuid,
    pub accepted_count: usize,
    pub rejected_count: usize,
    pub processing_time_ms: f64,
    pub kafka_partition: Option<i32>,
    pub dlq_events: Vec<Uuid>,
    pub warnings: Vec<String>,
}

/// A batch as handed to the spool/broker: validated events plus the id used
/// for spool-segment naming and response correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBatch {
    pub batch_id: Uuid,
    pub events: Vec<Event>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxEventType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxRecord {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub event_data: Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CheckpointRecord {
    pub consumer_name: String,
    pub last_processed_id: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSensitivity {
    Public,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchDocument {
    pub id: String,
    pub tenant_id: String,
    pub entity_type: String,
    pub updated_at: DateTime<Utc>,
    pub visible_to_roles: Vec<String>,
    pub data_sensitivity: DataSensitivity,
    pub restricted_fields: Vec<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearnerLevel {
    Beginner,
    Easy,
    Moderate,
    Challenging,
    Advanced,
}

impl LearnerLevel {
    pub fn step_down(self) -> Self {
        use LearnerLevel::*;
        match self {
            Beginner => Beginner,
            Easy => Beginner,
            Moderate => Easy,
            Challenging => Moderate,
            Advanced => Challenging,
        }
    }

    pub fn step_up(self) -> Self {
        use LearnerLevel::*;
        match self {
            Beginner => Easy,
            Easy => Moderate,
            Moderate => Challenging,
            Challenging => Advanced,
            Advanced => Advanced,
        }
    }

    pub fn from_baseline_score(score: f64) -> Self {
        if score >= 0.90 {
            LearnerLevel::Advanced
        } else if score >= 0.75 {
            LearnerLevel::Challenging
        } else if score >= 0.50 {
            LearnerLevel::Moderate
        } else if score >= 0.25 {
            LearnerLevel::Easy
        } else {
            LearnerLevel::Beginner
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelAlertEntry {
    pub at: DateTime<Utc>,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentEntry {
    pub at: DateTime<Utc>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnerState {
    pub learner_id: Uuid,
    pub tenant_id: Uuid,
    pub current_level: LearnerLevel,
    pub performance_score: f64,
    pub engagement_score: f64,
    pub consecutive_correct: u32,
    pub consecutive_incorrect: u32,
    pub session_duration_minutes: f64,
    pub last_break_at: Option<DateTime<Utc>>,
    pub recent_sel_alerts: VecDeque<SelAlertEntry>,
    pub baseline_established: bool,
    pub recent_assessments: VecDeque<AssessmentEntry>,
    pub last_applied_event_id: Option<Uuid>,
}

impl LearnerState {
    pub fn new(learner_id: Uuid, tenant_id: Uuid) -> Self {
        Self {
            learner_id,
            tenant_id,
            current_level: LearnerLevel::Moderate,
            performance_score: 0.5,
            engagement_score: 0.5,
            consecutive_correct: 0,
            consecutive_incorrect: 0,
            session_duration_minutes: 0.0,
            last_break_at: None,
            recent_sel_alerts: VecDeque::new(),
            baseline_established: false,
            recent_assessments: VecDeque::new(),
            last_applied_event_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    LevelSuggested,
    GameBreak,
    SelIntervention,
    LearningPathUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundAction {
    pub action_id: Uuid,
    pub action_type: ActionType,
    pub target_service: String,
    pub learner_id: Uuid,
    pub tenant_id: Uuid,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub not_before: Option<DateTime<Utc>>,
}
