//! Pure transformation from a raw outbox record into a search document (C5).
//!
//! Subject-aware expansions are additive: the original text is preserved and
//! an expansion is appended, so recall increases without destroying
//! exact-match precision.

use crate::model::OutboxRecord;
use chrono::Utc;
use serde_json::{json, Map, Value};

pub struct Transformer;

impl Transformer {
    pub fn transform(record: &OutboxRecord) -> Option<Map<String, Value>> {
        let data = record.event_data.as_object()?;
        let mut fields = match record.aggregate_type.as_str() {
            "learner" | "user" => Self::transform_learner(data),
            "lesson" | "course" => Self::transform_lesson(data),
            "assessment" => Self::transform_assessment(data),
            _ => Self::transform_generic(data),
        };
        fields.insert("updated_at".to_string(), json!(Utc::now()));
        Some(fields)
    }

    fn normalize_name(name: &str) -> String {
        let collapsed: String = name.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-')
            .collect()
    }

    fn transform_learner(data: &Map<String, Value>) -> Map<String, Value> {
        let mut out = data.clone();
        if let Some(name) = data.get("name").and_then(|v| v.as_str()) {
            out.insert("normalized_name".into(), json!(Self::normalize_name(name)));
        }
        if let Some(email) = data.get("email").and_then(|v| v.as_str()) {
            out.insert("email".into(), json!(email.to_lowercase()));
        }
        let search_text = [data.get("name"), data.get("grade"), data.get("subject")]
            .into_iter()
            .flatten()
            .filter_map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        out.insert("search_text".into(), json!(search_text));
        out.insert("name_suggest".into(), json!({ "input": [data.get("name").and_then(|v| v.as_str()).unwrap_or("")], "weight": 10 }));
        out
    }

    fn transform_lesson(data: &Map<String, Value>) -> Map<String, Value> {
        let mut out = data.clone();
        let subject = data.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        let title = data.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let description = data.get("description").and_then(|v| v.as_str()).unwrap_or("");
        let mut search_text = format!("{title} {description}");
        search_text = Self::expand_for_subject(&search_text, subject);
        out.insert("search_text".into(), json!(search_text));
        let weight = if data.get("active").and_then(|v| v.as_bool()).unwrap_or(false) { 20 } else { 5 };
        out.insert("title_suggest".into(), json!({ "input": [title], "weight": weight }));
        out
    }

    fn transform_assessment(data: &Map<String, Value>) -> Map<String, Value> {
        let mut out = data.clone();
        let subject = data.get("subject").and_then(|v| v.as_str()).unwrap_or("");
        let content = data.get("content").and_then(|v| v.as_str()).unwrap_or("");
        out.insert("search_text".into(), json!(Self::expand_for_subject(content, subject)));
        out
    }

    fn transform_generic(data: &Map<String, Value>) -> Map<String, Value> {
        data.clone()
    }

    /// Appends subject-specific term expansions to `text` without removing
    /// the original, matching the additive-recall contract.
    fn expand_for_subject(text: &str, subject: &str) -> String {
        let expansion = match subject.to_lowercase().as_str() {
            "mathematics" | "math" => Self::expand_math_terms(text),
            "english" | "ela" => Self::expand_ela_terms(text),
            "science" => Self::expand_science_terms(text),
            "social_studies" | "social studies" => Self::expand_social_studies_terms(text),
            _ => String::new(),
        };
        if expansion.is_empty() {
            text.to_string()
        } else {
            format!("{text} {expansion}")
        }
    }

    fn expand_math_terms(text: &str) -> String {
        let mut terms = Vec::new();
        if text.contains('+') {
            terms.push("addition plus sum");
        }
        if text.contains('-') {
            terms.push("subtraction minus difference");
        }
        if text.contains('*') || text.contains('×') {
            terms.push("multiplication times product");
        }
        if text.contains('/') || text.contains('÷') {
            terms.push("division divide quotient");
        }
        if text.contains('/') && text.chars().any(|c| c.is_ascii_digit()) {
            terms.push("fraction numerator denominator");
        }
        terms.join(" ")
    }

    fn expand_ela_terms(text: &str) -> String {
        let lower = text.to_lowercase();
        let mut terms = Vec::new();
        for (needle, expansion) in [
            ("metaphor", "figurative language comparison"),
            ("simile", "figurative language comparison like as"),
            ("theme", "central idea message"),
            ("character", "protagonist antagonist narrative"),
        ] {
            if lower.contains(needle) {
                terms.push(expansion);
            }
        }
        terms.join(" ")
    }

    fn expand_science_terms(text: &str) -> String {
        let mut terms = Vec::new();
        if text.chars().any(|c| c == 'e' || c == 'E') && text.contains('^') {
            terms.push("scientific notation exponent");
        }
        let lower = text.to_lowercase();
        for (needle, expansion) in [
            ("photosynthesis", "plant energy sunlight chlorophyll"),
            ("ecosystem", "habitat environment organisms"),
        ] {
            if lower.contains(needle) {
                terms.push(expansion);
            }
        }
        terms.join(" ")
    }

    fn expand_social_studies_terms(text: &str) -> String {
        let lower = text.to_lowercase();
        let mut terms = Vec::new();
        for (needle, expansion) in [
            ("war", "conflict battle military history"),
            ("revolution", "uprising rebellion political change"),
            ("century", "era period timeline"),
        ] {
            if lower.contains(needle) {
                terms.push(expansion);
            }
        }
        terms.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(aggregate_type: &str, data: Value) -> OutboxRecord {
        OutboxRecord {
            id: 1,
            aggregate_type: aggregate_type.to_string(),
            aggregate_id: Uuid::new_v4().to_string(),
            event_type: "UPDATE".to_string(),
            event_data: data,
            created_at: Utc::now(),
            processed_at: None,
        }
    }

    #[test]
    fn math_expansion_is_additive() {
        let rec = record("lesson", json!({"title": "Adding Fractions", "description": "1/2 + 1/4", "subject": "mathematics"}));
        let out = Transformer::transform(&rec).unwrap();
        let text = out["search_text"].as_str().unwrap();
        assert!(text.contains("1/2 + 1/4"));
        assert!(text.contains("addition"));
        assert!(text.contains("fraction"));
    }

    #[test]
    fn learner_name_is_normalized() {
        let rec = record("learner", json!({"name": "  Jo   Smith!! ", "email": "JO@Example.COM"}));
        let out = Transformer::transform(&rec).unwrap();
        assert_eq!(out["normalized_name"].as_str().unwrap(), "Jo Smith");
        assert_eq!(out["email"].as_str().unwrap(), "jo@example.com");
    }
}
