//! Graph model: role-typed nodes in an arena, edges between them, and the
//! compile step that validates the topology once before execution.
//!
//! Nodes are addressed by `NodeId` (arena index) after compilation, so
//! cycles need no shared ownership.

pub mod condition;
pub mod edge;
pub mod node;
pub mod state;

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use smartgraph_core::error::{Result, SmartGraphError};

pub use condition::{Condition, ConditionEvaluator, Patterns};
pub use edge::Edge;
pub use node::{ActorRole, CompiledNode, FailurePolicy, Node, NodeKind};
pub use state::PipelineState;

/// Index of a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

/// A workflow graph. Mutable until `compile()`, frozen afterwards.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    compiled: Option<Compiled>,
}

#[derive(Debug)]
struct Compiled {
    nodes: Vec<CompiledNode>,
    index: HashMap<String, NodeId>,
    /// Outgoing edges per node, in declaration order.
    outgoing: Vec<Vec<Edge>>,
    patterns: Patterns,
    entry: NodeId,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.compiled.is_some() {
            return Err(SmartGraphError::GraphStructure(format!(
                "cannot {} after compile()",
                what
            )));
        }
        Ok(())
    }

    pub fn add_node(&mut self, node: Node) -> Result<()> {
        self.ensure_mutable("add a node")?;
        self.nodes.push(node);
        Ok(())
    }

    pub fn add_edge(&mut self, edge: Edge) -> Result<()> {
        self.ensure_mutable("add an edge")?;
        self.edges.push(edge);
        Ok(())
    }

    pub fn set_entry(&mut self, name: impl Into<String>) -> Result<()> {
        self.ensure_mutable("change the entry node")?;
        self.entry = Some(name.into());
        Ok(())
    }

    /// Validate the graph and freeze it. Calling it again is a no-op.
    ///
    /// Topology problems (duplicate names, missing or unknown entry, edges
    /// naming unknown nodes, nodes unreachable from the entry) are
    /// `Configuration` errors; malformed node config, malformed edge
    /// conditions, and more than one unconditional edge leaving a node are
    /// `Validation` errors.
    pub fn compile(&mut self) -> Result<()> {
        if self.compiled.is_some() {
            return Ok(());
        }

        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if index.insert(node.name.clone(), NodeId(i)).is_some() {
                return Err(SmartGraphError::Configuration(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        let entry_name = self
            .entry
            .as_deref()
            .ok_or_else(|| SmartGraphError::Configuration("no entry node set".into()))?;
        let entry = *index.get(entry_name).ok_or_else(|| {
            SmartGraphError::Configuration(format!("entry node '{}' is not in the graph", entry_name))
        })?;

        let mut outgoing: Vec<Vec<Edge>> = vec![Vec::new(); self.nodes.len()];
        for edge in &self.edges {
            let from = index.get(&edge.from);
            let to = index.get(&edge.to);
            let from = match (from, to) {
                (Some(from), Some(_)) => *from,
                _ => {
                    return Err(SmartGraphError::Configuration(format!(
                        "edge {} -> {} names an unknown node",
                        edge.from, edge.to
                    )))
                }
            };
            outgoing[from.0].push(edge.clone());
        }

        let reachable = reachable_from(entry, &outgoing, &index);
        if let Some(node) = self
            .nodes
            .iter()
            .enumerate()
            .find(|(i, _)| !reachable.contains(&NodeId(*i)))
            .map(|(_, n)| n)
        {
            return Err(SmartGraphError::Configuration(format!(
                "node '{}' is unreachable from entry '{}'",
                node.name, entry_name
            )));
        }

        let nodes = self
            .nodes
            .iter()
            .map(Node::compile)
            .collect::<Result<Vec<_>>>()?;

        let mut patterns = Patterns::new();
        for (i, edges) in outgoing.iter().enumerate() {
            if edges.iter().filter(|e| e.is_unconditional()).count() > 1 {
                return Err(SmartGraphError::Validation(format!(
                    "node '{}' has more than one unconditional edge",
                    self.nodes[i].name
                )));
            }
            for edge in edges {
                if let Some(condition) = &edge.condition {
                    ConditionEvaluator::validate(condition)
                        .and_then(|()| patterns.register(condition))
                        .map_err(|e| {
                            SmartGraphError::Validation(format!(
                                "edge {} -> {}: {}",
                                edge.from, edge.to, e
                            ))
                        })?;
                }
            }
        }

        debug!(
            nodes = nodes.len(),
            edges = self.edges.len(),
            entry = %entry_name,
            "Graph compiled"
        );
        self.compiled = Some(Compiled {
            nodes,
            index,
            outgoing,
            patterns,
            entry,
        });
        Ok(())
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled.is_some()
    }

    fn compiled(&self) -> Result<&Compiled> {
        self.compiled.as_ref().ok_or_else(|| {
            SmartGraphError::GraphStructure("graph must be compiled before execution".into())
        })
    }

    /// Entry node of a compiled graph.
    pub fn entry(&self) -> Result<NodeId> {
        Ok(self.compiled()?.entry)
    }

    /// Look up a node id by name (compiled graphs only).
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.compiled.as_ref()?.index.get(name).copied()
    }

    /// The compiled node behind `id`.
    pub fn node(&self, id: NodeId) -> Result<&CompiledNode> {
        self.compiled()?.nodes.get(id.0).ok_or_else(|| {
            SmartGraphError::GraphStructure(format!("node id {} is not in the graph", id.0))
        })
    }

    /// Outgoing edges of `id` in declaration order.
    pub fn outgoing(&self, id: NodeId) -> &[Edge] {
        self.compiled
            .as_ref()
            .and_then(|c| c.outgoing.get(id.0))
            .map(|edges| edges.as_slice())
            .unwrap_or(&[])
    }

    /// The edge to follow from `id` given `state`; `None` is terminal.
    pub fn next_edge(&self, id: NodeId, state: &PipelineState) -> Option<&Edge> {
        let compiled = self.compiled.as_ref()?;
        ConditionEvaluator::select_with(compiled.outgoing.get(id.0)?, state, &compiled.patterns)
    }

    /// Every compiled node, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &CompiledNode> {
        self.compiled.iter().flat_map(|c| c.nodes.iter())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn reachable_from(
    entry: NodeId,
    outgoing: &[Vec<Edge>],
    index: &HashMap<String, NodeId>,
) -> HashSet<NodeId> {
    let mut seen = HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(id) = queue.pop_front() {
        for edge in &outgoing[id.0] {
            if let Some(&next) = index.get(&edge.to) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
    }
    seen
}
