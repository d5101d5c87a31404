use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// A directed edge between two nodes, named by node name.
///
/// An edge without a condition is unconditional: it is taken when no
/// conditional edge leaving the same node is satisfied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create an edge guarded by `condition`.
    pub fn when(from: impl Into<String>, to: impl Into<String>, condition: Condition) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: Some(condition),
        }
    }

    /// Create an edge guarded by an expression such as `status == "ok"`.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: impl Into<String>,
    ) -> Self {
        Self::when(from, to, Condition::Expr { expr: expr.into() })
    }

    pub fn is_unconditional(&self) -> bool {
        self.condition.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = Edge::always("a", "b");
        assert_eq!(e.from, "a");
        assert_eq!(e.to, "b");
        assert!(e.is_unconditional());

        let e = Edge::conditional("a", "c", r#"status == "ok""#);
        assert!(!e.is_unconditional());
        assert!(matches!(e.condition, Some(Condition::Expr { .. })));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let edge = Edge::when("a", "b", Condition::exists("search_results"));
        let json = serde_json::to_string(&edge).unwrap();
        assert!(json.contains(r#""op":"exists""#));
        let parsed: Edge = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, edge);

        let plain: Edge = serde_json::from_str(r#"{"from": "a", "to": "b"}"#).unwrap();
        assert!(plain.is_unconditional());
    }
}
