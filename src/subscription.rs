//! Subscription Evaluator: type match + semver range + CEL-like boolean
//! filter, with a thread-safe compiled-program LRU cache.
//!
//! The filter engine is grounded on `crates/boternity-core/src/workflow/expression.rs`
//! from the mondalsuman-boternity example repo (`jexl_eval::Evaluator` +
//! `eval_in_context`), the nearest sandboxed expression evaluator in the
//! retrieved pack to the spec's "CEL-like filter" (§9 explicitly allows any
//! equivalent engine). `jexl-eval`'s public surface, as used there, compiles
//! and evaluates a string in one call rather than exposing a reusable AST
//! handle, so the "compiled program" this cache stores is the validated
//! expression plus its static cost estimate; re-parsing a short boolean
//! expression on every evaluation is inexpensive, and the cache still
//! satisfies the externally observable contract (size bound, concurrent
//! `get`/`put`, `hits`/`misses`/`size`).

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use jexl_eval::Evaluator;
use lru::LruCache;
use semver::Version;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::SubscriptionSpec;
use crate::events::Event;
use crate::template::{self, ContextBuilder};

/// Per-evaluation cost budget, in estimated AST-node units (§4.5).
pub const DEFAULT_COST_BUDGET: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid semver range '{range}': {reason}")]
    InvalidRange { range: String, reason: String },
    #[error("invalid semver version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },
    #[error("filter '{expr}' failed to evaluate: {reason}")]
    EvalFailed { expr: String, reason: String },
    #[error("filter '{expr}' returned a non-boolean result: {got}")]
    NonBooleanResult { expr: String, got: Value },
    #[error("filter '{expr}' exceeds the evaluation cost budget ({cost} > {budget})")]
    CostBudgetExceeded { expr: String, cost: u64, budget: u64 },
    #[error("event schema '{0}' is malformed")]
    MalformedSchema(String),
    #[error("failed to expand subscription input '{name}': {reason}")]
    PayloadTemplate { name: String, reason: String },
}

/// A clause of the whitespace-separated range grammar in §4.5.
#[derive(Debug, Clone)]
enum ClauseOp {
    Exact,
    Caret,
    Tilde,
    Ge,
    Gt,
    Le,
    Lt,
}

#[derive(Debug, Clone)]
struct Clause {
    op: ClauseOp,
    version: Version,
}

/// A parsed semver range: a conjunction of clauses, all of which must match.
#[derive(Debug, Clone, Default)]
pub struct Range(Vec<Clause>);

impl Range {
    pub fn parse(input: &str) -> Result<Self, SubscriptionError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::default());
        }
        let mut clauses = Vec::new();
        for token in input.split_whitespace() {
            clauses.push(Self::parse_clause(token)?);
        }
        Ok(Self(clauses))
    }

    fn parse_clause(token: &str) -> Result<Clause, SubscriptionError> {
        let (op, rest) = if let Some(rest) = token.strip_prefix('^') {
            (ClauseOp::Caret, rest)
        } else if let Some(rest) = token.strip_prefix('~') {
            (ClauseOp::Tilde, rest)
        } else if let Some(rest) = token.strip_prefix(">=") {
            (ClauseOp::Ge, rest)
        } else if let Some(rest) = token.strip_prefix("<=") {
            (ClauseOp::Le, rest)
        } else if let Some(rest) = token.strip_prefix('>') {
            (ClauseOp::Gt, rest)
        } else if let Some(rest) = token.strip_prefix('<') {
            (ClauseOp::Lt, rest)
        } else {
            (ClauseOp::Exact, token)
        };

        let version = Version::parse(rest).map_err(|e| SubscriptionError::InvalidVersion {
            version: rest.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Clause { op, version })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.0.iter().all(|clause| match clause.op {
            ClauseOp::Exact => version == &clause.version,
            ClauseOp::Ge => version >= &clause.version,
            ClauseOp::Gt => version > &clause.version,
            ClauseOp::Le => version <= &clause.version,
            ClauseOp::Lt => version < &clause.version,
            ClauseOp::Caret => {
                let upper = Version::new(clause.version.major + 1, 0, 0);
                version >= &clause.version && version < &upper
            }
            ClauseOp::Tilde => {
                let upper = Version::new(clause.version.major, clause.version.minor + 1, 0);
                version >= &clause.version && version < &upper
            }
        })
    }
}

/// Empty range or empty event version are treated as compatible (§4.5).
pub fn is_schema_compatible(range_str: &str, event_version_str: &str) -> Result<bool, SubscriptionError> {
    if range_str.trim().is_empty() || event_version_str.trim().is_empty() {
        return Ok(true);
    }
    let range = Range::parse(range_str).map_err(|e| SubscriptionError::InvalidRange {
        range: range_str.to_string(),
        reason: e.to_string(),
    })?;
    let version = Version::parse(event_version_str.trim()).map_err(|e| SubscriptionError::InvalidVersion {
        version: event_version_str.to_string(),
        reason: e.to_string(),
    })?;
    Ok(range.matches(&version))
}

struct CachedProgram {
    cost: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct SubscriptionEvaluator {
    evaluator: Evaluator<'static>,
    cache: Mutex<LruCache<String, Arc<CachedProgram>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    cost_budget: u64,
}

impl SubscriptionEvaluator {
    pub fn new(cache_capacity: usize) -> Self {
        Self::with_cost_budget(cache_capacity, DEFAULT_COST_BUDGET)
    }

    pub fn with_cost_budget(cache_capacity: usize, cost_budget: u64) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            evaluator: Evaluator::new(),
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            cost_budget,
        }
    }

    pub fn cache_stats(&self) -> ProgramCacheStats {
        let cache = self.cache.lock().expect("cache mutex poisoned");
        ProgramCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: cache.len(),
        }
    }

    fn get_or_compile(&self, expr: &str) -> Result<Arc<CachedProgram>, SubscriptionError> {
        {
            let mut cache = self.cache.lock().expect("cache mutex poisoned");
            if let Some(program) = cache.get(expr) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(program.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let cost = estimate_cost(expr);
        if cost > self.cost_budget {
            return Err(SubscriptionError::CostBudgetExceeded {
                expr: expr.to_string(),
                cost,
                budget: self.cost_budget,
            });
        }
        let program = Arc::new(CachedProgram { cost });
        let mut cache = self.cache.lock().expect("cache mutex poisoned");
        cache.put(expr.to_string(), program.clone());
        Ok(program)
    }

    fn evaluate_filter(&self, expr: &str, event: &Event) -> Result<bool, SubscriptionError> {
        let _program = self.get_or_compile(expr)?;
        let context = event_context(event)?;
        let result = self
            .evaluator
            .eval_in_context(expr, &context)
            .map_err(|e| SubscriptionError::EvalFailed {
                expr: expr.to_string(),
                reason: e.to_string(),
            })?;
        match result {
            Value::Bool(b) => Ok(b),
            other => Err(SubscriptionError::NonBooleanResult {
                expr: expr.to_string(),
                got: other,
            }),
        }
    }

    /// `EvaluateSubscription(sub, event) → bool`, short-circuiting per §4.5.
    pub fn evaluate_subscription(&self, sub: &SubscriptionSpec, event: &Event) -> Result<bool, SubscriptionError> {
        if !sub.events.iter().any(|e| e == &event.event_type) {
            return Ok(false);
        }

        if !sub.schema_version.is_empty() {
            let (_, event_version) = event
                .schema_parts()
                .map_err(|e| SubscriptionError::MalformedSchema(e.to_string()))?;
            if !is_schema_compatible(&sub.schema_version, event_version)? {
                return Ok(false);
            }
        }

        for filter in &sub.filters {
            if !self.evaluate_filter(filter, event)? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// `ProcessEventPayload(payload, sub)`: expands each `sub.inputs[name]`
    /// template against root `.payload.*`, using the same engine as §4.4.
    pub fn process_event_payload(
        payload: &Value,
        sub: &SubscriptionSpec,
    ) -> Result<std::collections::HashMap<String, Value>, SubscriptionError> {
        let ctx = ContextBuilder::new().with_payload(payload.clone()).build();
        let mut result = std::collections::HashMap::new();
        for (name, tpl) in &sub.inputs {
            let expanded = template::expand(tpl, &ctx).map_err(|e| SubscriptionError::PayloadTemplate {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            result.insert(name.clone(), Value::String(expanded));
        }
        Ok(result)
    }
}

fn event_context(event: &Event) -> Result<Value, SubscriptionError> {
    Ok(json!({
        "event_type": event.event_type,
        "payload": event.payload,
        "source": event.metadata.source,
        "timestamp": event.metadata.timestamp.timestamp(),
    }))
}

/// Static AST-node-count estimate used as the per-evaluation cost bound.
/// Every identifier/number/string run and every operator/punctuation
/// character counts as one unit; this over-counts relative to a true AST
/// but that only makes the budget conservative, never permissive. Because
/// the supported filter grammar has no loops or recursion, a bounded
/// expression size already bounds evaluation work, so no separate runtime
/// instruction counter is needed.
fn estimate_cost(expr: &str) -> u64 {
    let mut cost = 0u64;
    let mut chars = expr.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            cost += 1;
            while matches!(chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
                chars.next();
            }
        } else if c == '\'' || c == '"' {
            cost += 1;
            for next in chars.by_ref() {
                if next == c {
                    break;
                }
            }
        } else {
            cost += 1;
        }
    }
    cost
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;

    fn make_event(event_type: &str, schema_version: &str, payload: Value) -> Event {
        Event::new(event_type, schema_version, payload, "org/lib")
    }

    #[test]
    fn exact_matches_only_itself() {
        let range = Range::parse("1.2.3").unwrap();
        assert!(range.matches(&Version::parse("1.2.3").unwrap()));
        assert!(!range.matches(&Version::parse("1.2.4").unwrap()));
        assert!(!range.matches(&Version::parse("1.2.2").unwrap()));
    }

    #[test]
    fn caret_matches_same_major_gte_minor_patch() {
        let range = Range::parse("^1.2.3").unwrap();
        assert!(range.matches(&Version::parse("1.2.3").unwrap()));
        assert!(range.matches(&Version::parse("1.2.9").unwrap()));
        assert!(range.matches(&Version::parse("1.9.0").unwrap()));
        assert!(!range.matches(&Version::parse("1.2.2").unwrap()));
        assert!(!range.matches(&Version::parse("2.0.0").unwrap()));
    }

    #[test]
    fn tilde_matches_same_minor_gte_patch() {
        let range = Range::parse("~1.2.3").unwrap();
        assert!(range.matches(&Version::parse("1.2.3").unwrap()));
        assert!(range.matches(&Version::parse("1.2.9").unwrap()));
        assert!(!range.matches(&Version::parse("1.3.0").unwrap()));
        assert!(!range.matches(&Version::parse("1.2.2").unwrap()));
    }

    #[test]
    fn comparison_operators() {
        assert!(Range::parse(">=1.0.0").unwrap().matches(&Version::parse("1.0.0").unwrap()));
        assert!(!Range::parse(">1.0.0").unwrap().matches(&Version::parse("1.0.0").unwrap()));
        assert!(Range::parse("<=1.0.0").unwrap().matches(&Version::parse("1.0.0").unwrap()));
        assert!(!Range::parse("<1.0.0").unwrap().matches(&Version::parse("1.0.0").unwrap()));
    }

    #[test]
    fn multiple_clauses_are_conjoined() {
        let range = Range::parse(">=1.0.0 <2.0.0").unwrap();
        assert!(range.matches(&Version::parse("1.5.0").unwrap()));
        assert!(!range.matches(&Version::parse("2.0.0").unwrap()));
    }

    #[test]
    fn empty_range_or_version_is_compatible() {
        assert!(is_schema_compatible("", "1.0.0").unwrap());
        assert!(is_schema_compatible("^1.0.0", "").unwrap());
    }

    #[test]
    fn subscription_matches_type_schema_and_filter() {
        let evaluator = SubscriptionEvaluator::new(16);
        let sub = SubscriptionSpec {
            artifact: "org/lib:default".to_string(),
            events: vec!["build_completed".to_string()],
            schema_version: "~1.0.0".to_string(),
            filters: vec!["payload.status == 'success'".to_string()],
            workflow: "deploy".to_string(),
            inputs: Default::default(),
        };
        let event = make_event("build_completed", "1.0.0", json!({"status": "success", "environment": "production"}));
        assert!(evaluator.evaluate_subscription(&sub, &event).unwrap());

        let failed = make_event("build_completed", "1.0.0", json!({"status": "failure"}));
        assert!(!evaluator.evaluate_subscription(&sub, &failed).unwrap());
    }

    #[test]
    fn subscription_type_mismatch_short_circuits() {
        let evaluator = SubscriptionEvaluator::new(16);
        let sub = SubscriptionSpec {
            artifact: "org/lib:default".to_string(),
            events: vec!["deployment_started".to_string()],
            schema_version: String::new(),
            filters: vec![],
            workflow: "deploy".to_string(),
            inputs: Default::default(),
        };
        let event = make_event("build_completed", "1.0.0", json!({}));
        assert!(!evaluator.evaluate_subscription(&sub, &event).unwrap());
    }

    #[test]
    fn cache_hit_miss_counts() {
        let evaluator = SubscriptionEvaluator::new(16);
        let event = make_event("build_completed", "1.0.0", json!({"status": "success"}));
        let exprs = ["payload.status == 'success'", "payload.status == 'failure'"];
        for _ in 0..5 {
            for expr in &exprs {
                let _ = evaluator.evaluate_filter(expr, &event);
            }
        }
        let stats = evaluator.cache_stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.hits, 10 - 2);
        assert_eq!(stats.size, 2);
    }

    #[test]
    fn non_boolean_filter_is_an_error() {
        let evaluator = SubscriptionEvaluator::new(16);
        let event = make_event("build_completed", "1.0.0", json!({"status": "success"}));
        let result = evaluator.evaluate_filter("payload.status", &event);
        assert!(matches!(result, Err(SubscriptionError::NonBooleanResult { .. })));
    }

    #[test]
    fn process_event_payload_expands_inputs() {
        let mut inputs = std::collections::HashMap::new();
        inputs.insert("version".to_string(), "{{ .payload.version }}".to_string());
        let sub = SubscriptionSpec {
            artifact: "org/lib:default".to_string(),
            events: vec!["build_completed".to_string()],
            schema_version: String::new(),
            filters: vec![],
            workflow: "deploy".to_string(),
            inputs,
        };
        let payload = json!({"version": "2.0.0"});
        let result = SubscriptionEvaluator::process_event_payload(&payload, &sub).unwrap();
        assert_eq!(result["version"], Value::String("2.0.0".to_string()));
    }

    #[test]
    fn missing_payload_field_errors() {
        let mut inputs = std::collections::HashMap::new();
        inputs.insert("version".to_string(), "{{ .payload.missing }}".to_string());
        let sub = SubscriptionSpec {
            artifact: "org/lib:default".to_string(),
            events: vec!["build_completed".to_string()],
            schema_version: String::new(),
            filters: vec![],
            workflow: "deploy".to_string(),
            inputs,
        };
        let payload = json!({"version": "2.0.0"});
        assert!(SubscriptionEvaluator::process_event_payload(&payload, &sub).is_err());
    }
}
