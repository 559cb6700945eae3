//! Correlation Rule Engine
//!
//! Declarative rules evaluated against every event: condition lists with
//! logical operators, plus sliding-window threshold counting. Rule mutation
//! takes effect for the next evaluated event without a restart.

use crate::{json_path, json_to_string, Severity};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Simple,
    Threshold,
    Sequence,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    In,
}

/// One item of the flat condition list: either a logical-operator header or
/// a field/operator/value leaf. Leaves fold left-to-right, each combined
/// with the operator of the preceding header (`and` if none).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionItem {
    Header {
        logical_operator: LogicalOp,
    },
    Leaf {
        field: String,
        operator: ConditionOp,
        value: Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuleWindowConfig {
    /// Matching-event count that fires a threshold rule
    #[serde(default)]
    pub threshold: u64,
    /// Sliding window length in seconds
    #[serde(default)]
    pub time_window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTemplate {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub id: String,
    pub name: String,
    pub kind: RuleKind,
    pub severity: Severity,
    pub enabled: bool,
    pub conditions: Vec<ConditionItem>,
    #[serde(default)]
    pub config: RuleWindowConfig,
    pub alert_template: AlertTemplate,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule: {0}")]
    Validation(String),
    #[error("rule not found: {0}")]
    NotFound(String),
}

/// A rule match, ready to become an alert candidate.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
}

struct EngineStats {
    events_evaluated: AtomicU64,
    rules_matched: AtomicU64,
    evaluation_errors: AtomicU64,
}

/// Live rule store plus per-rule threshold windows.
pub struct RuleEngine {
    rules: DashMap<String, CorrelationRule>,
    /// Per-rule ring of matching-event timestamps, evicted lazily
    windows: DashMap<String, Mutex<VecDeque<DateTime<Utc>>>>,
    placeholder: Regex,
    stats: EngineStats,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: DashMap::new(),
            windows: DashMap::new(),
            placeholder: Regex::new(r"\{([A-Za-z0-9_.]+)\}").expect("static regex"),
            stats: EngineStats {
                events_evaluated: AtomicU64::new(0),
                rules_matched: AtomicU64::new(0),
                evaluation_errors: AtomicU64::new(0),
            },
        }
    }

    // -------------------------------------------------------------------------
    // Rule CRUD
    // -------------------------------------------------------------------------

    pub fn create_rule(&self, rule: CorrelationRule) -> Result<(), RuleError> {
        validate_rule(&rule)?;
        if self.rules.contains_key(&rule.id) {
            return Err(RuleError::Validation(format!("rule id already exists: {}", rule.id)));
        }
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn update_rule(&self, rule: CorrelationRule) -> Result<(), RuleError> {
        validate_rule(&rule)?;
        if !self.rules.contains_key(&rule.id) {
            return Err(RuleError::NotFound(rule.id));
        }
        // Window state resets with the new definition.
        self.windows.remove(&rule.id);
        self.rules.insert(rule.id.clone(), rule);
        Ok(())
    }

    pub fn enable_rule(&self, rule_id: &str) -> Result<(), RuleError> {
        self.set_enabled(rule_id, true)
    }

    pub fn disable_rule(&self, rule_id: &str) -> Result<(), RuleError> {
        self.set_enabled(rule_id, false)
    }

    fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<(), RuleError> {
        let mut rule = self
            .rules
            .get_mut(rule_id)
            .ok_or_else(|| RuleError::NotFound(rule_id.to_string()))?;
        rule.enabled = enabled;
        Ok(())
    }

    pub fn delete_rule(&self, rule_id: &str) -> Result<(), RuleError> {
        self.windows.remove(rule_id);
        self.rules
            .remove(rule_id)
            .map(|_| ())
            .ok_or_else(|| RuleError::NotFound(rule_id.to_string()))
    }

    pub fn get_rule(&self, rule_id: &str) -> Option<CorrelationRule> {
        self.rules.get(rule_id).map(|r| r.clone())
    }

    pub fn list_rules(&self) -> Vec<CorrelationRule> {
        self.rules.iter().map(|r| r.clone()).collect()
    }

    /// Dry-run a rule definition against a batch of event payloads.
    /// Stateless: threshold windows are neither read nor written.
    pub fn test_rule(&self, rule: &CorrelationRule, events: &[Value]) -> Result<Vec<bool>, RuleError> {
        validate_rule(rule)?;
        Ok(events.iter().map(|e| eval_conditions(&rule.conditions, e)).collect())
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate all enabled rules against one event payload. A rule that
    /// fails mid-evaluation is logged and skipped; it never blocks the
    /// remaining rules.
    pub fn evaluate_event(&self, payload: &Value, now: DateTime<Utc>) -> Vec<RuleMatch> {
        self.stats.events_evaluated.fetch_add(1, Ordering::Relaxed);

        let mut matches = Vec::new();
        let snapshot: Vec<CorrelationRule> =
            self.rules.iter().filter(|r| r.enabled).map(|r| r.clone()).collect();

        for rule in snapshot {
            match self.evaluate_rule(&rule, payload, now) {
                Ok(Some(rule_match)) => {
                    self.stats.rules_matched.fetch_add(1, Ordering::Relaxed);
                    matches.push(rule_match);
                }
                Ok(None) => {}
                Err(e) => {
                    self.stats.evaluation_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(rule_id = %rule.id, error = %e, "rule evaluation failed, skipping rule for this event");
                }
            }
        }
        matches
    }

    fn evaluate_rule(
        &self,
        rule: &CorrelationRule,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleMatch>, RuleError> {
        if !eval_conditions(&rule.conditions, payload) {
            return Ok(None);
        }

        let fired = match rule.kind {
            RuleKind::Simple => true,
            RuleKind::Threshold => self.bump_window(rule, now),
            // Rejected at create/update time, so this only fires for rules
            // injected around the CRUD surface.
            RuleKind::Sequence => {
                return Err(RuleError::Validation("sequence rules are not evaluable".to_string()))
            }
        };

        if !fired {
            return Ok(None);
        }

        Ok(Some(RuleMatch {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            title: self.resolve_template(&rule.alert_template.title, payload),
            description: self.resolve_template(&rule.alert_template.description, payload),
            tags: rule.tags.clone(),
        }))
    }

    /// Record a matching event in the rule's sliding window; returns true
    /// when the threshold is reached. The window clears on firing, so the
    /// rule re-arms only after `threshold` fresh matches.
    fn bump_window(&self, rule: &CorrelationRule, now: DateTime<Utc>) -> bool {
        let slot = self
            .windows
            .entry(rule.id.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = slot.lock();

        let cutoff = now - Duration::seconds(rule.config.time_window_secs as i64);
        while window.front().is_some_and(|ts| *ts < cutoff) {
            window.pop_front();
        }

        window.push_back(now);
        if window.len() as u64 >= rule.config.threshold {
            window.clear();
            true
        } else {
            false
        }
    }

    /// Resolve `{field}` placeholders (dot paths allowed) against the event
    /// payload; unresolvable placeholders are left verbatim.
    fn resolve_template(&self, template: &str, payload: &Value) -> String {
        self.placeholder
            .replace_all(template, |caps: &regex::Captures<'_>| {
                match json_path(payload, &caps[1]) {
                    Some(v) => json_to_string(v),
                    None => caps[0].to_string(),
                }
            })
            .to_string()
    }

    pub fn stats(&self) -> RuleEngineStats {
        RuleEngineStats {
            rules_total: self.rules.len() as u64,
            rules_enabled: self.rules.iter().filter(|r| r.enabled).count() as u64,
            events_evaluated: self.stats.events_evaluated.load(Ordering::Relaxed),
            rules_matched: self.stats.rules_matched.load(Ordering::Relaxed),
            evaluation_errors: self.stats.evaluation_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleEngineStats {
    pub rules_total: u64,
    pub rules_enabled: u64,
    pub events_evaluated: u64,
    pub rules_matched: u64,
    pub evaluation_errors: u64,
}

fn validate_rule(rule: &CorrelationRule) -> Result<(), RuleError> {
    if rule.id.trim().is_empty() {
        return Err(RuleError::Validation("rule id must not be empty".to_string()));
    }
    if rule.kind == RuleKind::Sequence {
        return Err(RuleError::Validation("sequence rules are not supported".to_string()));
    }

    let leaves = rule
        .conditions
        .iter()
        .filter(|c| matches!(c, ConditionItem::Leaf { .. }))
        .count();
    if leaves == 0 {
        return Err(RuleError::Validation("rule needs at least one condition leaf".to_string()));
    }
    if matches!(rule.conditions.last(), Some(ConditionItem::Header { .. })) {
        return Err(RuleError::Validation("condition list ends with a dangling operator".to_string()));
    }
    let mut previous_was_header = false;
    for item in &rule.conditions {
        let is_header = matches!(item, ConditionItem::Header { .. });
        if is_header && previous_was_header {
            return Err(RuleError::Validation("consecutive logical operators".to_string()));
        }
        previous_was_header = is_header;
    }

    if rule.kind == RuleKind::Threshold {
        if rule.config.threshold == 0 {
            return Err(RuleError::Validation("threshold rule needs threshold >= 1".to_string()));
        }
        if rule.config.time_window_secs == 0 {
            return Err(RuleError::Validation("threshold rule needs a time window".to_string()));
        }
    }

    Ok(())
}

/// Fold the flat condition list left-to-right. Missing fields evaluate the
/// leaf to false, never to an error.
fn eval_conditions(conditions: &[ConditionItem], payload: &Value) -> bool {
    let mut result: Option<bool> = None;
    let mut pending_op = LogicalOp::And;

    for item in conditions {
        match item {
            ConditionItem::Header { logical_operator } => {
                pending_op = *logical_operator;
            }
            ConditionItem::Leaf { field, operator, value } => {
                let leaf = eval_leaf(payload, field, *operator, value);
                result = Some(match (result, pending_op) {
                    (None, _) => leaf,
                    (Some(acc), LogicalOp::And) => acc && leaf,
                    (Some(acc), LogicalOp::Or) => acc || leaf,
                });
            }
        }
    }

    result.unwrap_or(false)
}

fn eval_leaf(payload: &Value, field: &str, operator: ConditionOp, expected: &Value) -> bool {
    let Some(actual) = json_path(payload, field) else {
        return false;
    };

    match operator {
        ConditionOp::Eq => values_equal(actual, expected),
        ConditionOp::Neq => !values_equal(actual, expected),
        ConditionOp::Gt => compare(actual, expected).map(|o| o == std::cmp::Ordering::Greater).unwrap_or(false),
        ConditionOp::Lt => compare(actual, expected).map(|o| o == std::cmp::Ordering::Less).unwrap_or(false),
        ConditionOp::Gte => compare(actual, expected).map(|o| o != std::cmp::Ordering::Less).unwrap_or(false),
        ConditionOp::Lte => compare(actual, expected).map(|o| o != std::cmp::Ordering::Greater).unwrap_or(false),
        ConditionOp::Contains => match (actual.as_str(), expected.as_str()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => match actual.as_array() {
                Some(items) => items.iter().any(|i| values_equal(i, expected)),
                None => false,
            },
        },
        ConditionOp::In => match expected.as_array() {
            Some(options) => options.iter().any(|o| values_equal(actual, o)),
            None => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // Sensors disagree about numbers-as-strings; compare numerically when
    // both sides coerce.
    match (coerce_f64(a), coerce_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    let x = coerce_f64(a)?;
    let y = coerce_f64(b)?;
    x.partial_cmp(&y)
}

fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}
