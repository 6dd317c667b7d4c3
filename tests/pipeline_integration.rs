//! Round-trip of the CDC indexing pipeline's pure stages (C5 → C6): a raw
//! outbox record for a math lesson should come out with additive subject
//! expansion and PII fields masked per role.

use chrono::Utc;
use learnloop_core::access_filter::AccessFilter;
use learnloop_core::model::OutboxRecord;
use learnloop_core::transform::Transformer;
use serde_json::json;
use std::collections::HashSet;
use uuid::Uuid;

fn roles(rs: &[&str]) -> HashSet<String> {
    rs.iter().map(|s| s.to_string()).collect()
}

#[test]
fn lesson_update_expands_math_terms_and_survives_filtering() {
    let record = OutboxRecord {
        id: 1,
        aggregate_type: "lesson".into(),
        aggregate_id: Uuid::new_v4().to_string(),
        event_type: "UPDATE".into(),
        event_data: json!({
            "subject": "mathematics",
            "title": "Fractions",
            "description": "add 1/2 + 1/4 using the + operator",
            "topics": ["fractions"],
        }),
        created_at: Utc::now(),
        processed_at: None,
    };

    let fields = Transformer::transform(&record).expect("lesson should produce fields");
    assert!(fields["search_text"].as_str().unwrap().contains("plus"));

    let outcome = AccessFilter::filter("lesson", fields, &roles(&["teacher"]), &roles(&["teacher", "guardian"]))
        .expect("teacher should see the lesson");
    assert_eq!(outcome.visible_to_roles, vec!["teacher".to_string()]);
}

#[test]
fn learner_update_masks_ssn_for_non_admin_caller() {
    let record = OutboxRecord {
        id: 2,
        aggregate_type: "learner".into(),
        aggregate_id: Uuid::new_v4().to_string(),
        event_type: "UPDATE".into(),
        event_data: json!({
            "name": "  jo   smith  ",
            "email": "JO@Example.com",
            "ssn": "123-45-6789",
        }),
        created_at: Utc::now(),
        processed_at: None,
    };

    let fields = Transformer::transform(&record).expect("learner should produce fields");
    let outcome = AccessFilter::filter("learner", fields, &roles(&["teacher"]), &roles(&["teacher", "admin"]))
        .expect("teacher is in the intended audience");

    assert!(!outcome.fields.contains_key("ssn"));
    assert!(outcome.restricted_fields.contains(&"ssn".to_string()));
    assert_eq!(outcome.data_sensitivity, learnloop_core::model::DataSensitivity::High);
}
