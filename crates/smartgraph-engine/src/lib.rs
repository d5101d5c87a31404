//! Graph execution for SmartGraph.
//!
//! A workflow is a [`Graph`] of role-typed nodes joined by optionally
//! conditioned edges. [`GraphEngine`] drives the control loop: it hands the
//! active node to the [`TaskExecutor`], merges the result into the
//! [`PipelineState`], lets the [`ConditionEvaluator`] pick the next edge, and
//! persists progress through the [`CheckpointManager`]. Human nodes suspend
//! the loop until the host calls [`GraphEngine::resume`].

pub mod checkpoint;
pub mod engine;
pub mod executor;
pub mod graph;

pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointStore, ExecutionSnapshot, FileCheckpointStore,
    SqliteCheckpointStore, CHECKPOINT_VERSION,
};
pub use engine::{EngineSettings, GraphEngine, RunStatus};
pub use executor::{NodeOutcome, SideEffect, TaskExecutor};
pub use graph::{
    ActorRole, CompiledNode, Condition, ConditionEvaluator, Edge, FailurePolicy, Graph, Node,
    NodeId, NodeKind, Patterns, PipelineState,
};
