//! Typed `data` payloads for each [`EventType`] and their JSON Schemas.
//!
//! Payload structs are what the reducer reads and what the session workflow
//! writes. [`PayloadSchemas`] derives a JSON Schema for each one with
//! [`schemars::schema_for!`] and checks outgoing payloads with `jsonschema`.
//! Checking is warn-only so logs written by newer versions stay appendable.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::EventType;

/// `data` of a SessionCreated event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionCreatedData {
    pub session_name: String,
}

/// `data` of a SessionUpdated event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct SessionUpdatedData {
    pub session_name: Option<String>,
}

/// Document kind used for the requirements text.
pub const REQUIREMENTS_KIND: &str = "requirements";

/// Document kind used for generated policies.
pub const POLICY_KIND: &str = "policy";

/// `data` of DocumentCreated, DocumentEdited, and DocumentReworked events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct DocumentData {
    /// `"requirements"` or `"policy"`.
    pub kind: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    /// Attempt number within the generation run that produced a policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Validator message a reworked policy was asked to fix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_error: Option<String>,
    /// Storage key of the policy artifact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

/// `data` of a ValidationCompleted event. The policy id is the event's
/// `document_id`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ValidationData {
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// `data` of a TestRun event: the summary of one generation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct TestRunData {
    pub attempts: u32,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    pub elapsed_ms: u64,
}

/// `data` of a NotesAdded event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct NotesData {
    pub content: String,
}

// ── Registry ───────────────────────────────────────────────────────

/// JSON Schemas for every known event payload, compiled once.
pub struct PayloadSchemas {
    schemas: HashMap<&'static str, serde_json::Value>,
    validators: HashMap<&'static str, jsonschema::Validator>,
}

fn schema_value<T: JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T))
        .unwrap_or_else(|_| serde_json::json!({"type": "object"}))
}

impl PayloadSchemas {
    pub fn new() -> Self {
        let schemas: HashMap<&'static str, serde_json::Value> = [
            ("SessionCreated", schema_value::<SessionCreatedData>()),
            ("SessionUpdated", schema_value::<SessionUpdatedData>()),
            ("DocumentCreated", schema_value::<DocumentData>()),
            ("DocumentEdited", schema_value::<DocumentData>()),
            ("DocumentReworked", schema_value::<DocumentData>()),
            ("ValidationCompleted", schema_value::<ValidationData>()),
            ("TestRun", schema_value::<TestRunData>()),
            ("NotesAdded", schema_value::<NotesData>()),
        ]
        .into_iter()
        .collect();

        let mut validators = HashMap::new();
        for (name, schema) in &schemas {
            match jsonschema::validator_for(schema) {
                Ok(v) => {
                    validators.insert(*name, v);
                }
                Err(e) => tracing::warn!("Skipping invalid payload schema for {name}: {e}"),
            }
        }
        Self {
            schemas,
            validators,
        }
    }

    /// The JSON Schema registered for an event type.
    pub fn schema(&self, event_type: &EventType) -> Option<&serde_json::Value> {
        self.schemas.get(event_type.as_str())
    }

    /// Check a payload against its type's schema. Returns one message per
    /// violation; unknown types always pass.
    pub fn check(&self, event_type: &EventType, data: &serde_json::Value) -> Vec<String> {
        let Some(validator) = self.validators.get(event_type.as_str()) else {
            return Vec::new();
        };
        validator
            .iter_errors(data)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect()
    }
}

impl Default for PayloadSchemas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_known_type_has_a_schema() {
        let schemas = PayloadSchemas::new();
        for t in EventType::KNOWN {
            let schema = schemas.schema(t).unwrap();
            assert_eq!(schema["type"], "object", "{t}");
        }
        assert!(schemas.schema(&EventType::Unknown("PolicyGenerated".into())).is_none());
    }

    #[test]
    fn valid_payload_has_no_violations() {
        let schemas = PayloadSchemas::new();
        let data = serde_json::to_value(ValidationData {
            passed: false,
            message: Some("syntax error".into()),
            attempt: Some(1),
        })
        .unwrap();
        assert!(schemas.check(&EventType::ValidationCompleted, &data).is_empty());
    }

    #[test]
    fn wrong_field_type_is_reported() {
        let schemas = PayloadSchemas::new();
        let violations = schemas.check(&EventType::TestRun, &json!({"attempts": "two"}));
        assert!(!violations.is_empty());
    }

    #[test]
    fn unknown_type_always_passes() {
        let schemas = PayloadSchemas::new();
        let violations = schemas.check(&EventType::Unknown("X".into()), &json!(42));
        assert!(violations.is_empty());
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let data: DocumentData = serde_json::from_value(json!({"content": "read-only"})).unwrap();
        assert_eq!(data.content, "read-only");
        assert!(data.kind.is_empty());
        assert_eq!(data.attempt, None);
    }
}
