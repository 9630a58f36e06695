//! Template Engine: safe expansion of `{{ .inputs.x }}` and
//! `{{ .steps.id.outputs.y }}` (also `{{ .payload.x }}` when expanding a
//! subscription's child-workflow inputs, §4.5).
//!
//! Grounded on the corpus's `template.rs` (`TemplateProcessor`), whose
//! peekable-char brace scanning this reuses; diverges from it in two ways
//! required by the spec: paths are dotted (`.inputs.x`, not a flat name) and
//! any unresolved reference is a hard [`TemplateError`] rather than a silent
//! no-op substitution.

use std::collections::HashMap;

use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unresolved template reference '{0}'")]
    MissingReference(String),
    #[error("malformed template expression: {0}")]
    Malformed(String),
    #[error("template reference '{0}' does not resolve to a scalar value")]
    NonScalar(String),
}

/// Immutable context a template string is expanded against. No filesystem
/// access, no environment lookups, no arbitrary code execution — only
/// dotted-path lookups into the tree the builder assembled.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct ContextBuilder {
    root: Map<String, Value>,
}

impl ContextBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inputs(mut self, inputs: &HashMap<String, Value>) -> Self {
        let map: Map<String, Value> = inputs.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        self.root.insert("inputs".to_string(), Value::Object(map));
        self
    }

    /// Adds (or merges into) `.steps.<step_id>.outputs`.
    pub fn with_step_outputs(mut self, step_id: &str, outputs: &HashMap<String, String>) -> Self {
        let steps = self
            .root
            .entry("steps".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(steps_map) = steps {
            let entry = steps_map
                .entry(step_id.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(step_obj) = entry {
                let outputs_map: Map<String, Value> = outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                step_obj.insert("outputs".to_string(), Value::Object(outputs_map));
            }
        }
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.root.insert("payload".to_string(), payload);
        self
    }

    pub fn build(self) -> TemplateContext {
        TemplateContext { root: self.root }
    }
}

/// Expands every `{{ .path.to.value }}` (optionally prefixed with `$`, i.e.
/// `${{ .path }}`, the form used in shell steps) in `text` against `ctx`.
/// Any reference that does not resolve is an error: the spec requires
/// failing rather than silently substituting empty.
pub fn expand(text: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let mut result = String::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        let (open_len, body_start) = if rest.starts_with("${{") {
            (3, 3)
        } else if rest.starts_with("{{") {
            (2, 2)
        } else {
            let ch = rest.chars().next().unwrap();
            result.push(ch);
            i += ch.len_utf8();
            continue;
        };

        let close_rel = rest.find("}}").ok_or_else(|| {
            TemplateError::Malformed(format!("unterminated template expression in '{text}'"))
        })?;
        if close_rel < body_start {
            return Err(TemplateError::Malformed(format!(
                "malformed template expression in '{text}'"
            )));
        }
        let path = rest[body_start..close_rel].trim();
        let value = resolve(path, ctx)?;
        result.push_str(&value);
        i += close_rel + 2;
        // account for the leading `$` being part of `open_len` already via rest slicing
        let _ = open_len;
    }
    Ok(result)
}

/// True if `text` contains no unresolved template syntax (used by callers
/// that want to validate ahead of executing a step).
pub fn extract_references(text: &str) -> Vec<String> {
    let mut refs = Vec::new();
    let mut i = 0;
    while i < text.len() {
        let rest = &text[i..];
        let body_start = if rest.starts_with("${{") {
            3
        } else if rest.starts_with("{{") {
            2
        } else {
            let ch = rest.chars().next().unwrap();
            i += ch.len_utf8();
            continue;
        };
        if let Some(close_rel) = rest.find("}}") {
            if close_rel >= body_start {
                refs.push(rest[body_start..close_rel].trim().to_string());
            }
            i += close_rel + 2;
        } else {
            break;
        }
    }
    refs
}

fn resolve(path: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    let path = path.strip_prefix('.').unwrap_or(path);
    if path.is_empty() {
        return Err(TemplateError::Malformed("empty template reference".to_string()));
    }
    let segments: Vec<&str> = path.split('.').collect();

    let mut current = segments
        .first()
        .and_then(|root_key| ctx.root.get(*root_key))
        .ok_or_else(|| TemplateError::MissingReference(path.to_string()))?;

    for segment in &segments[1..] {
        current = match current {
            Value::Object(map) => map
                .get(*segment)
                .ok_or_else(|| TemplateError::MissingReference(path.to_string()))?,
            _ => return Err(TemplateError::MissingReference(path.to_string())),
        };
    }

    scalar_to_string(current).ok_or_else(|| TemplateError::NonScalar(path.to_string()))
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_input_reference() {
        let mut inputs = HashMap::new();
        inputs.insert("msg".to_string(), json!("hello"));
        let ctx = ContextBuilder::new().with_inputs(&inputs).build();
        let out = expand("echo ${{ .inputs.msg }}", &ctx).unwrap();
        assert_eq!(out, "echo hello");
    }

    #[test]
    fn expands_step_output_reference() {
        let mut outputs = HashMap::new();
        outputs.insert("version".to_string(), "1.2.3".to_string());
        let ctx = ContextBuilder::new().with_step_outputs("build", &outputs).build();
        let out = expand("{{ .steps.build.outputs.version }}", &ctx).unwrap();
        assert_eq!(out, "1.2.3");
    }

    #[test]
    fn missing_reference_is_an_error_not_empty_string() {
        let ctx = ContextBuilder::new().build();
        let err = expand("{{ .inputs.nope }}", &ctx).unwrap_err();
        assert_eq!(err, TemplateError::MissingReference("inputs.nope".to_string()));
    }

    #[test]
    fn plain_text_is_passed_through() {
        let ctx = ContextBuilder::new().build();
        assert_eq!(expand("no templates here", &ctx).unwrap(), "no templates here");
    }

    #[test]
    fn expands_payload_reference_for_subscriptions() {
        let ctx = ContextBuilder::new()
            .with_payload(json!({"version": "2.0.0"}))
            .build();
        let out = expand("{{ .payload.version }}", &ctx).unwrap();
        assert_eq!(out, "2.0.0");
    }

    #[test]
    fn unterminated_expression_is_malformed() {
        let ctx = ContextBuilder::new().build();
        let err = expand("echo {{ .inputs.msg", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Malformed(_)));
    }

    #[test]
    fn non_scalar_reference_is_rejected() {
        let ctx = ContextBuilder::new()
            .with_payload(json!({"nested": {"a": 1}}))
            .build();
        let err = expand("{{ .payload.nested }}", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::NonScalar(_)));
    }
}
