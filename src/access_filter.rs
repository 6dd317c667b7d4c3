//! Field-level RBAC masking and sensitive-pattern redaction (C6).

use crate::model::DataSensitivity;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStrategy {
    Remove,
    Redact,
    Hash,
}

pub struct RbacRule {
    pub entity_type: &'static str,
    pub field_name: &'static str,
    pub allowed_roles: &'static [&'static str],
    pub mask_strategy: MaskStrategy,
}

lazy_static! {
    static ref RBAC_RULES: Vec<RbacRule> = vec![
        RbacRule { entity_type: "learner", field_name: "email", allowed_roles: &["teacher", "admin", "guardian"], mask_strategy: MaskStrategy::Redact },
        RbacRule { entity_type: "learner", field_name: "phone", allowed_roles: &["admin", "guardian"], mask_strategy: MaskStrategy::Redact },
        RbacRule { entity_type: "learner", field_name: "address", allowed_roles: &["admin", "guardian"], mask_strategy: MaskStrategy::Remove },
        RbacRule { entity_type: "learner", field_name: "ssn", allowed_roles: &["admin"], mask_strategy: MaskStrategy::Remove },
        RbacRule { entity_type: "assessment", field_name: "answers", allowed_roles: &["teacher", "admin"], mask_strategy: MaskStrategy::Remove },
        RbacRule { entity_type: "assessment", field_name: "scores", allowed_roles: &["teacher", "admin", "guardian"], mask_strategy: MaskStrategy::Redact },
        RbacRule { entity_type: "user", field_name: "salary", allowed_roles: &["admin"], mask_strategy: MaskStrategy::Hash },
        RbacRule { entity_type: "user", field_name: "personal_phone", allowed_roles: &["admin"], mask_strategy: MaskStrategy::Redact },
    ];

    static ref SENSITIVE_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("ssn", Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap()),
        ("phone", Regex::new(r"\b\d{3}[-.]\d{3}[-.]\d{4}\b").unwrap()),
        ("email", Regex::new(r"\b[\w.+-]+@[\w-]+\.[\w.-]+\b").unwrap()),
        ("credit_card", Regex::new(r"\b\d{4}[- ]?\d{4}[- ]?\d{4}[- ]?\d{4}\b").unwrap()),
    ];
}

pub struct AccessFilter;

pub struct FilterOutcome {
    pub fields: Map<String, Value>,
    pub visible_to_roles: Vec<String>,
    pub data_sensitivity: DataSensitivity,
    pub restricted_fields: Vec<String>,
}

impl AccessFilter {
    /// Returns `None` when the resulting `visible_to_roles` set is empty,
    /// meaning the document must not be indexed at all.
    pub fn filter(
        entity_type: &str,
        mut fields: Map<String, Value>,
        caller_roles: &HashSet<String>,
        intended_audience: &HashSet<String>,
    ) -> Option<FilterOutcome> {
        let had_ssn_or_similar = Self::has_high_sensitivity_fields(&fields);
        let mut restricted_fields = Vec::new();

        for rule in RBAC_RULES.iter().filter(|r| r.entity_type == entity_type) {
            if !fields.contains_key(rule.field_name) {
                continue;
            }
            let allowed: HashSet<&str> = rule.allowed_roles.iter().copied().collect();
            let permitted = caller_roles.iter().any(|r| allowed.contains(r.as_str()));
            if !permitted {
                restricted_fields.push(rule.field_name.to_string());
                Self::apply_mask(&mut fields, rule.field_name, rule.mask_strategy);
            }
        }

        Self::scan_sensitive_data(&mut fields);

        let visible_to_roles: Vec<String> =
            intended_audience.intersection(caller_roles).cloned().collect();
        if visible_to_roles.is_empty() {
            return None;
        }

        let data_sensitivity = if had_ssn_or_similar {
            DataSensitivity::High
        } else {
            Self::calculate_sensitivity(&fields)
        };

        Some(FilterOutcome { fields, visible_to_roles, data_sensitivity, restricted_fields })
    }

    fn apply_mask(fields: &mut Map<String, Value>, field: &str, strategy: MaskStrategy) {
        match strategy {
            MaskStrategy::Remove => {
                fields.remove(field);
            }
            MaskStrategy::Redact => {
                if let Some(Value::String(s)) = fields.get(field) {
                    let visible: String = s.chars().take(2).collect();
                    let masked = format!("{visible}{}", "*".repeat(s.len().saturating_sub(2)));
                    fields.insert(field.to_string(), Value::String(masked));
                }
            }
            MaskStrategy::Hash => {
                if let Some(v) = fields.get(field) {
                    let raw = v.to_string();
                    let digest = Sha256::digest(raw.as_bytes());
                    let short = hex::encode(&digest[..4]);
                    fields.insert(field.to_string(), Value::String(short));
                }
            }
        }
    }

    fn scan_sensitive_data(fields: &mut Map<String, Value>) {
        for (_, value) in fields.iter_mut() {
            if let Value::String(s) = value {
                let mut redacted = s.clone();
                for (_, re) in SENSITIVE_PATTERNS.iter() {
                    if re.is_match(&redacted) {
                        redacted = re.replace_all(&redacted, "[REDACTED]").to_string();
                    }
                }
                *value = Value::String(redacted);
            }
        }
    }

    fn has_high_sensitivity_fields(fields: &Map<String, Value>) -> bool {
        ["ssn", "credit_card", "salary", "medical_info"]
            .iter()
            .any(|f| fields.contains_key(*f))
    }

    fn calculate_sensitivity(fields: &Map<String, Value>) -> DataSensitivity {
        if ["ssn", "credit_card", "salary", "medical_info"].iter().any(|f| fields.contains_key(*f)) {
            DataSensitivity::High
        } else if ["email", "phone", "address", "birth_date"].iter().any(|f| fields.contains_key(*f)) {
            DataSensitivity::Medium
        } else if ["name", "grade", "subject"].iter().any(|f| fields.contains_key(*f)) {
            DataSensitivity::Low
        } else {
            DataSensitivity::Public
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roles(rs: &[&str]) -> HashSet<String> {
        rs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn removes_ssn_and_redacts_email_for_teacher() {
        let mut fields = Map::new();
        fields.insert("email".into(), json!("learner@example.com"));
        fields.insert("ssn".into(), json!("123-45-6789"));
        fields.insert("name".into(), json!("Jo Smith"));

        let outcome = AccessFilter::filter(
            "learner",
            fields,
            &roles(&["teacher"]),
            &roles(&["teacher", "admin", "guardian"]),
        )
        .unwrap();

        assert!(!outcome.fields.contains_key("ssn"));
        assert!(outcome.fields.contains_key("email"));
        assert_eq!(outcome.data_sensitivity, DataSensitivity::High);
        assert!(outcome.restricted_fields.contains(&"ssn".to_string()));
        assert_eq!(outcome.visible_to_roles, vec!["teacher".to_string()]);
    }

    #[test]
    fn empty_audience_intersection_skips_indexing() {
        let mut fields = Map::new();
        fields.insert("name".into(), json!("Jo Smith"));
        let outcome = AccessFilter::filter("learner", fields, &roles(&["student"]), &roles(&["teacher"]));
        assert!(outcome.is_none());
    }

    #[test]
    fn sensitive_pattern_in_free_text_is_redacted() {
        let mut fields = Map::new();
        fields.insert("notes".into(), json!("call 555-123-4567 for details"));
        let outcome = AccessFilter::filter("lesson", fields, &roles(&["teacher"]), &roles(&["teacher"])).unwrap();
        assert_eq!(outcome.fields["notes"], json!("call [REDACTED] for details"));
    }
}
