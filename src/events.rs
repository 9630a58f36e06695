//! Event Model: the enhanced event, its legacy counterpart, and a registry
//! of named schema validators.
//!
//! Grounded in shape on the corpus's `events.rs` `Event`/`EventType` split,
//! but narrowed to exactly what the spec names: events here are in-process
//! values only (no `EventLog` trait, no durable storage — that whole
//! concern is dropped, see DESIGN.md), and the type itself is generic
//! (`type`/`payload`) rather than a closed enum of agent-orchestration
//! variants.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

/// The enhanced wire format: `{type, schema, payload, metadata}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    /// `"<type>@<semver>"`.
    pub schema: String,
    pub payload: Value,
    pub metadata: EventMetadata,
}

/// The legacy wire format, accepted on input and losslessly convertible to
/// and from [`Event`] via `schema ↔ "<type>@<schema_version>"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub schema_version: String,
    pub payload: Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("malformed schema reference '{0}': expected '<type>@<version>'")]
    MalformedSchema(String),
    #[error("event failed validation against schema '{schema}': {reason}")]
    ValidationFailed { schema: String, reason: String },
}

impl Event {
    pub fn new(event_type: impl Into<String>, schema_version: impl AsRef<str>, payload: Value, source: impl Into<String>) -> Self {
        let event_type = event_type.into();
        let schema = format!("{}@{}", event_type, schema_version.as_ref());
        Self {
            event_type,
            schema,
            payload,
            metadata: EventMetadata {
                source: source.into(),
                timestamp: Utc::now(),
                correlation_id: None,
                trace_id: None,
            },
        }
    }

    /// Splits `schema` into `(type, version)`. Errors if there is no `@`.
    pub fn schema_parts(&self) -> Result<(&str, &str), EventError> {
        self.schema
            .rsplit_once('@')
            .ok_or_else(|| EventError::MalformedSchema(self.schema.clone()))
    }

    pub fn to_legacy(&self) -> Result<LegacyEvent, EventError> {
        let (_, version) = self.schema_parts()?;
        Ok(LegacyEvent {
            event_type: self.event_type.clone(),
            schema_version: version.to_string(),
            payload: self.payload.clone(),
            source: self.metadata.source.clone(),
            timestamp: self.metadata.timestamp,
        })
    }
}

impl From<LegacyEvent> for Event {
    fn from(legacy: LegacyEvent) -> Self {
        let schema = format!("{}@{}", legacy.event_type, legacy.schema_version);
        Self {
            event_type: legacy.event_type,
            schema,
            payload: legacy.payload,
            metadata: EventMetadata {
                source: legacy.source,
                timestamp: legacy.timestamp,
                correlation_id: None,
                trace_id: None,
            },
        }
    }
}

/// One named JSON-schema-like rule keyed by `"<type>@<semver>"`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRule {
    required: Vec<String>,
    enums: HashMap<String, Vec<String>>,
    numeric: Vec<String>,
    patterns: Vec<(String, Regex)>,
}

impl SchemaRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn require_enum(mut self, field: impl Into<String>, values: &[&str]) -> Self {
        let field = field.into();
        self.required.push(field.clone());
        self.enums.insert(field, values.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn optional_numeric(mut self, field: impl Into<String>) -> Self {
        self.numeric.push(field.into());
        self
    }

    pub fn optional_pattern(mut self, field: impl Into<String>, pattern: &str) -> Self {
        self.patterns
            .push((field.into(), Regex::new(pattern).expect("static pattern is valid")));
        self
    }

    fn validate(&self, schema: &str, payload: &Value) -> Result<(), EventError> {
        let obj = payload.as_object().ok_or_else(|| EventError::ValidationFailed {
            schema: schema.to_string(),
            reason: "payload is not a JSON object".to_string(),
        })?;

        for field in &self.required {
            if !obj.contains_key(field) {
                return Err(EventError::ValidationFailed {
                    schema: schema.to_string(),
                    reason: format!("missing required field '{field}'"),
                });
            }
        }
        for (field, allowed) in &self.enums {
            if let Some(value) = obj.get(field) {
                let as_str = value.as_str().unwrap_or("");
                if !allowed.iter().any(|a| a == as_str) {
                    return Err(EventError::ValidationFailed {
                        schema: schema.to_string(),
                        reason: format!("field '{field}' must be one of {allowed:?}, got '{as_str}'"),
                    });
                }
            }
        }
        for field in &self.numeric {
            if let Some(value) = obj.get(field) {
                if !value.is_number() {
                    return Err(EventError::ValidationFailed {
                        schema: schema.to_string(),
                        reason: format!("field '{field}' must be a number"),
                    });
                }
            }
        }
        for (field, re) in &self.patterns {
            if let Some(value) = obj.get(field) {
                let as_str = value.as_str().unwrap_or("");
                if !re.is_match(as_str) {
                    return Err(EventError::ValidationFailed {
                        schema: schema.to_string(),
                        reason: format!("field '{field}' does not match required pattern"),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventValidator {
    rules: HashMap<String, SchemaRule>,
}

impl EventValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema_ref: impl Into<String>, rule: SchemaRule) {
        self.rules.insert(schema_ref.into(), rule);
    }

    /// Seeds the baseline schemas every deployment registers.
    pub fn with_common_schemas() -> Self {
        let mut v = Self::new();
        v.register(
            "build_completed@1.0.0",
            SchemaRule::new()
                .require_enum("status", &["success", "failure"])
                .optional_numeric("duration")
                .optional_pattern("commit", "^[0-9a-f]{40}$"),
        );
        v.register(
            "deployment_started@1.0.0",
            SchemaRule::new()
                .require("environment")
                .require("version")
                .require("deployer"),
        );
        v.register(
            "test_results@1.0.0",
            SchemaRule::new()
                .require("total")
                .require("passed")
                .require("failed")
                .optional_numeric("coverage"),
        );
        v
    }

    /// No-ops if `event.schema` has no registered rule.
    pub fn validate_event(&self, event: &Event) -> Result<(), EventError> {
        match self.rules.get(&event.schema) {
            Some(rule) => rule.validate(&event.schema, &event.payload),
            None => Ok(()),
        }
    }
}
