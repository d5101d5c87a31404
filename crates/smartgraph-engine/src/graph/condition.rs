use std::borrow::Cow;
use std::collections::HashMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use smartgraph_core::error::{Result, SmartGraphError};

use super::edge::Edge;
use super::state::{render_value, PipelineState};

/// Branch predicate over pipeline state.
///
/// A missing key makes every leaf predicate false; `not` only negates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Value equals `value` exactly.
    Equals { key: String, value: Value },
    /// Key is present and its value differs from `value`.
    NotEquals { key: String, value: Value },
    /// Substring of a string, element of an array, or key of an object.
    Contains { key: String, value: Value },
    /// Numeric value within the inclusive bounds.
    InRange {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Exists { key: String },
    /// Present and not null, false, zero, or empty.
    Truthy { key: String },
    /// String value matches the regex.
    Matches { key: String, pattern: String },
    /// `key == "v"`, `key != "v"` or `key contains "v"`.
    Expr { expr: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn not_equals(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::NotEquals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn contains(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Contains {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn in_range(key: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self::InRange {
            key: key.into(),
            min,
            max,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    pub fn truthy(key: impl Into<String>) -> Self {
        Self::Truthy { key: key.into() }
    }

    pub fn matches(key: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            key: key.into(),
            pattern: pattern.into(),
        }
    }

    pub fn expr(expr: impl Into<String>) -> Self {
        Self::Expr { expr: expr.into() }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::All { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::Any { conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExprOp {
    Eq,
    Ne,
    Contains,
}

/// Parse `key OP "value"`. The earliest operator in the text wins, so
/// quoted values may themselves contain operators.
fn parse_expr(expr: &str) -> Option<(&str, ExprOp, &str)> {
    let expr = expr.trim();
    let (pos, op, len) = [("==", ExprOp::Eq), ("!=", ExprOp::Ne), (" contains ", ExprOp::Contains)]
        .iter()
        .filter_map(|(token, op)| expr.find(token).map(|pos| (pos, *op, token.len())))
        .min_by_key(|(pos, _, _)| *pos)?;

    let key = expr[..pos].trim();
    let raw = expr[pos + len..].trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let value = raw.strip_prefix('"')?.strip_suffix('"')?;
    Some((key, op, value))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn contains_value(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
        (Value::Array(items), needle) => items.iter().any(|item| item == needle),
        (Value::Object(obj), Value::String(key)) => obj.contains_key(key),
        _ => false,
    }
}

/// Regexes of `matches` conditions, compiled once per distinct pattern.
#[derive(Debug, Clone, Default)]
pub struct Patterns {
    compiled: HashMap<String, Regex>,
}

impl Patterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile every `matches` pattern reachable in `condition`.
    pub fn register(&mut self, condition: &Condition) -> Result<()> {
        match condition {
            Condition::Matches { pattern, .. } => {
                if !self.compiled.contains_key(pattern) {
                    let re = Regex::new(pattern).map_err(|e| {
                        SmartGraphError::Validation(format!("bad pattern '{}': {}", pattern, e))
                    })?;
                    self.compiled.insert(pattern.clone(), re);
                }
                Ok(())
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().try_for_each(|c| self.register(c))
            }
            Condition::Not { condition } => self.register(condition),
            _ => Ok(()),
        }
    }

    pub fn get(&self, pattern: &str) -> Option<&Regex> {
        self.compiled.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// The registered regex, or a one-off compile for unregistered patterns.
    fn lookup(&self, pattern: &str) -> Option<Cow<'_, Regex>> {
        match self.compiled.get(pattern) {
            Some(re) => Some(Cow::Borrowed(re)),
            None => Regex::new(pattern).ok().map(Cow::Owned),
        }
    }
}

/// Pure edge-selection logic.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate an optional condition. No condition is always true.
    pub fn evaluate(condition: Option<&Condition>, state: &PipelineState) -> bool {
        Self::evaluate_with(condition, state, &Patterns::default())
    }

    /// `evaluate` using regexes compiled ahead of time.
    pub fn evaluate_with(
        condition: Option<&Condition>,
        state: &PipelineState,
        patterns: &Patterns,
    ) -> bool {
        condition.map_or(true, |c| Self::check(c, state, patterns))
    }

    fn check(condition: &Condition, state: &PipelineState, patterns: &Patterns) -> bool {
        match condition {
            Condition::Equals { key, value } => state.get(key) == Some(value),
            Condition::NotEquals { key, value } => state.get(key).is_some_and(|v| v != value),
            Condition::Contains { key, value } => {
                state.get(key).is_some_and(|v| contains_value(v, value))
            }
            Condition::InRange { key, min, max } => state
                .get(key)
                .and_then(|v| v.as_f64())
                .is_some_and(|n| min.map_or(true, |lo| n >= lo) && max.map_or(true, |hi| n <= hi)),
            Condition::Exists { key } => state.contains(key),
            Condition::Truthy { key } => state.get(key).is_some_and(is_truthy),
            Condition::Matches { key, pattern } => state
                .get_str(key)
                .is_some_and(|s| patterns.lookup(pattern).is_some_and(|re| re.is_match(s))),
            Condition::Expr { expr } => match parse_expr(expr) {
                Some((key, op, expected)) => state.get(key).map(render_value).is_some_and(|actual| {
                    match op {
                        ExprOp::Eq => actual == expected,
                        ExprOp::Ne => actual != expected,
                        ExprOp::Contains => actual.contains(expected),
                    }
                }),
                None => false,
            },
            Condition::All { conditions } => {
                conditions.iter().all(|c| Self::check(c, state, patterns))
            }
            Condition::Any { conditions } => {
                conditions.iter().any(|c| Self::check(c, state, patterns))
            }
            Condition::Not { condition } => !Self::check(condition, state, patterns),
        }
    }

    /// Pick the edge to follow: the first satisfied conditional edge in
    /// declaration order, else the unconditional edge. `None` is terminal.
    pub fn select<'a>(edges: &'a [Edge], state: &PipelineState) -> Option<&'a Edge> {
        Self::select_with(edges, state, &Patterns::default())
    }

    /// `select` using regexes compiled ahead of time.
    pub fn select_with<'a>(
        edges: &'a [Edge],
        state: &PipelineState,
        patterns: &Patterns,
    ) -> Option<&'a Edge> {
        edges
            .iter()
            .filter(|e| !e.is_unconditional())
            .find(|e| Self::evaluate_with(e.condition.as_ref(), state, patterns))
            .or_else(|| edges.iter().find(|e| e.is_unconditional()))
    }

    /// Reject conditions that can never be evaluated meaningfully.
    pub fn validate(condition: &Condition) -> Result<()> {
        let invalid = |msg: String| -> Result<()> { Err(SmartGraphError::Validation(msg)) };
        match condition {
            Condition::Equals { key, .. }
            | Condition::NotEquals { key, .. }
            | Condition::Contains { key, .. }
            | Condition::Exists { key }
            | Condition::Truthy { key }
                if key.is_empty() =>
            {
                invalid("condition key must not be empty".into())
            }
            Condition::InRange { key, min, max } => {
                if key.is_empty() {
                    return invalid("condition key must not be empty".into());
                }
                match (min, max) {
                    (None, None) => invalid(format!("in_range on '{}' has no bounds", key)),
                    (Some(lo), Some(hi)) if lo > hi => {
                        invalid(format!("in_range on '{}' has min > max", key))
                    }
                    _ => Ok(()),
                }
            }
            Condition::Matches { key, pattern } => {
                if key.is_empty() {
                    return invalid("condition key must not be empty".into());
                }
                Regex::new(pattern)
                    .map(|_| ())
                    .map_err(|e| SmartGraphError::Validation(format!("bad pattern '{}': {}", pattern, e)))
            }
            Condition::Expr { expr } => match parse_expr(expr) {
                Some(_) => Ok(()),
                None => invalid(format!("unparseable expression '{}'", expr)),
            },
            Condition::All { conditions } | Condition::Any { conditions } => {
                if conditions.is_empty() {
                    return invalid("all/any needs at least one condition".into());
                }
                conditions.iter().try_for_each(Self::validate)
            }
            Condition::Not { condition } => Self::validate(condition),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> PipelineState {
        let mut s = PipelineState::new();
        for (k, v) in pairs {
            s.set(*k, v.clone());
        }
        s
    }

    #[test]
    fn test_no_condition_is_true() {
        assert!(ConditionEvaluator::evaluate(None, &PipelineState::new()));
    }

    #[test]
    fn test_leaf_predicates() {
        let s = state(&[
            ("status", json!("success")),
            ("score", json!(7.5)),
            ("tags", json!(["rust", "async"])),
            ("output", json!("The file was created successfully.")),
            ("empty", json!("")),
        ]);
        let eval = |c: Condition| ConditionEvaluator::evaluate(Some(&c), &s);

        assert!(eval(Condition::equals("status", "success")));
        assert!(!eval(Condition::equals("status", "failure")));
        assert!(eval(Condition::not_equals("status", "failure")));
        assert!(!eval(Condition::not_equals("missing", "x")));
        assert!(eval(Condition::contains("output", "created")));
        assert!(eval(Condition::contains("tags", "rust")));
        assert!(!eval(Condition::contains("tags", "go")));
        assert!(eval(Condition::in_range("score", Some(5.0), Some(7.5))));
        assert!(!eval(Condition::in_range("score", Some(8.0), None)));
        assert!(!eval(Condition::in_range("status", Some(0.0), None)));
        assert!(eval(Condition::exists("empty")));
        assert!(!eval(Condition::truthy("empty")));
        assert!(eval(Condition::truthy("tags")));
        assert!(eval(Condition::matches("status", "^succ")));
        assert!(!eval(Condition::matches("score", ".*")));
    }

    #[test]
    fn test_expressions() {
        let s = state(&[("status", json!("success")), ("count", json!(3))]);
        let eval = |e: &str| ConditionEvaluator::evaluate(Some(&Condition::expr(e)), &s);

        assert!(eval(r#"status == "success""#));
        assert!(!eval(r#"status == "failure""#));
        assert!(eval(r#"status != "failure""#));
        assert!(eval(r#"status contains "cess""#));
        assert!(eval(r#"count == "3""#));
        assert!(!eval(r#"missing == "value""#));
        assert!(!eval("this is not valid"));
    }

    #[test]
    fn test_expression_value_may_hold_operator() {
        let s = state(&[("q", json!("a==b"))]);
        assert!(ConditionEvaluator::evaluate(
            Some(&Condition::expr(r#"q == "a==b""#)),
            &s
        ));
    }

    #[test]
    fn test_combinators() {
        let s = state(&[("a", json!(true)), ("b", json!(false))]);
        let eval = |c: Condition| ConditionEvaluator::evaluate(Some(&c), &s);

        assert!(eval(Condition::any(vec![Condition::truthy("a"), Condition::truthy("b")])));
        assert!(!eval(Condition::all(vec![Condition::truthy("a"), Condition::truthy("b")])));
        assert!(eval(Condition::negate(Condition::exists("missing"))));
    }

    #[test]
    fn test_select_first_satisfied_then_fallback() {
        let edges = vec![
            Edge::always("router", "fallback"),
            Edge::when("router", "first", Condition::equals("route", "x")),
            Edge::when("router", "second", Condition::exists("route")),
        ];

        let s = state(&[("route", json!("x"))]);
        assert_eq!(ConditionEvaluator::select(&edges, &s).unwrap().to, "first");

        let s = state(&[("route", json!("y"))]);
        assert_eq!(ConditionEvaluator::select(&edges, &s).unwrap().to, "second");

        let s = PipelineState::new();
        assert_eq!(ConditionEvaluator::select(&edges, &s).unwrap().to, "fallback");
    }

    #[test]
    fn test_select_terminal_without_fallback() {
        let edges = vec![Edge::when("a", "b", Condition::exists("go"))];
        assert!(ConditionEvaluator::select(&edges, &PipelineState::new()).is_none());
        assert!(ConditionEvaluator::select(&[], &PipelineState::new()).is_none());
    }

    #[test]
    fn test_patterns_registered_once() {
        let condition = Condition::any(vec![
            Condition::matches("query", "^weather"),
            Condition::negate(Condition::matches("topic", "^weather")),
            Condition::all(vec![Condition::matches("query", r"\d+")]),
        ]);
        let mut patterns = Patterns::new();
        patterns.register(&condition).unwrap();
        patterns.register(&condition).unwrap();

        assert_eq!(patterns.len(), 2);
        assert!(patterns.get("^weather").is_some());
        assert!(patterns.get(r"\d+").is_some());

        let s = state(&[("query", json!("weather in Paris")), ("topic", json!("weather"))]);
        assert!(ConditionEvaluator::evaluate_with(Some(&condition), &s, &patterns));
        let s = state(&[("query", json!("news")), ("topic", json!("weather"))]);
        assert!(!ConditionEvaluator::evaluate_with(Some(&condition), &s, &patterns));

        let err = patterns
            .register(&Condition::matches("k", "(unclosed"))
            .unwrap_err();
        assert!(matches!(err, SmartGraphError::Validation(_)));
        assert_eq!(patterns.len(), 2);
    }

    #[test]
    fn test_validate() {
        assert!(ConditionEvaluator::validate(&Condition::expr(r#"a == "b""#)).is_ok());
        let bad = vec![
            Condition::expr("nonsense"),
            Condition::expr(r#"a == b"#),
            Condition::matches("k", "(unclosed"),
            Condition::in_range("k", None, None),
            Condition::in_range("k", Some(2.0), Some(1.0)),
            Condition::exists(""),
            Condition::all(vec![]),
            Condition::negate(Condition::expr("bad")),
        ];
        for c in bad {
            assert!(
                matches!(ConditionEvaluator::validate(&c), Err(SmartGraphError::Validation(_))),
                "{:?} should be invalid",
                c
            );
        }
    }

    #[test]
    fn test_condition_serialization() {
        let c: Condition = serde_json::from_value(json!({
            "op": "all",
            "conditions": [
                {"op": "equals", "key": "status", "value": "ok"},
                {"op": "in_range", "key": "score", "min": 0.5}
            ]
        }))
        .unwrap();
        assert_eq!(
            c,
            Condition::all(vec![
                Condition::equals("status", "ok"),
                Condition::in_range("score", Some(0.5), None),
            ])
        );
    }
}
