use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data threaded through one execution pass.
///
/// Keys are strings; values are JSON. The engine owns the live copy and
/// replaces it wholesale with the executor's result after a node succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineState {
    data: BTreeMap<String, Value>,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: BTreeMap<String, Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data.insert(key.into(), Value::String(value.into()));
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Merge another state into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &PipelineState) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Plain-text rendering of a value for prompts and queries.
    ///
    /// Strings render as-is. Search records (objects with a `title`) render
    /// as `title: snippet (url)`, one per line. Anything else renders as
    /// compact JSON. Missing keys render as `None`.
    pub fn render(&self, key: &str) -> Option<String> {
        self.data.get(key).map(render_value)
    }
}

pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(obj) if obj.contains_key("title") => {
                    let field = |k: &str| obj.get(k).and_then(|v| v.as_str()).unwrap_or("");
                    format!("{}: {} ({})", field("title"), field("snippet"), field("url"))
                }
                other => render_value(other),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_operations() {
        let mut state = PipelineState::new();
        state.set_str("user_input", "capital of France");
        state.set("count", json!(42));

        assert_eq!(state.get_str("user_input"), Some("capital of France"));
        assert_eq!(state.get("count"), Some(&json!(42)));
        assert_eq!(state.get("missing"), None);
        assert_eq!(state.remove("count"), Some(json!(42)));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_merge() {
        let mut a = PipelineState::new();
        a.set_str("a", "1");
        a.set_str("b", "2");

        let mut b = PipelineState::new();
        b.set_str("b", "overwritten");
        b.set_str("c", "3");

        a.merge(&b);
        assert_eq!(a.get_str("a"), Some("1"));
        assert_eq!(a.get_str("b"), Some("overwritten"));
        assert_eq!(a.get_str("c"), Some("3"));
    }

    #[test]
    fn test_render_records_and_scalars() {
        let mut state = PipelineState::new();
        state.set(
            "search_results",
            json!([
                {"title": "Paris", "snippet": "Capital of France", "url": "https://p"},
                {"title": "Lyon", "snippet": "Second city", "url": "https://l"}
            ]),
        );
        state.set("n", json!(3));
        state.set_str("s", "plain");

        assert_eq!(
            state.render("search_results").unwrap(),
            "Paris: Capital of France (https://p)\nLyon: Second city (https://l)"
        );
        assert_eq!(state.render("n").unwrap(), "3");
        assert_eq!(state.render("s").unwrap(), "plain");
        assert_eq!(state.render("missing"), None);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut state = PipelineState::new();
        state.set_str("k", "v");
        assert_eq!(serde_json::to_value(&state).unwrap(), json!({"k": "v"}));
    }
}
