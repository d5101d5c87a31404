use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use smartgraph_core::config::EngineConfig;
use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::types::SessionId;
use smartgraph_memory::MemoryManager;

use crate::checkpoint::{Checkpoint, CheckpointManager, ExecutionSnapshot};
use crate::executor::{NodeOutcome, SideEffect, TaskExecutor};
use crate::graph::{
    ActorRole, CompiledNode, FailurePolicy, Graph, NodeId, NodeKind, PipelineState,
};

/// Control-loop tunables.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_steps_per_run: usize,
    /// Save a checkpoint every N completed cycles; 0 saves only at suspension points.
    pub checkpoint_every: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff_ms: config.retry_backoff_ms,
            max_steps_per_run: config.max_steps_per_run,
            checkpoint_every: config.checkpoint_every,
        }
    }
}

/// Where a run stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// No outgoing edge was satisfied; the final pipeline state.
    Completed(PipelineState),
    /// A human node is waiting; call `resume` with its input.
    AwaitingInput {
        node: String,
        prompt: String,
        /// Text emitted by nodes since the previous suspension.
        emitted: Vec<String>,
    },
    /// The cancellation token fired. The engine stays at the interrupted node.
    Cancelled,
}

struct Checkpointing {
    manager: Arc<CheckpointManager>,
    session_id: SessionId,
}

fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Drives a compiled graph: runs the active node, merges its result,
/// follows the selected edge, and suspends at human nodes.
///
/// One engine serves one session; its pipeline state, position, and
/// memory handle are not shared with other sessions.
pub struct GraphEngine {
    graph: Graph,
    executor: TaskExecutor,
    memory: Arc<MemoryManager>,
    settings: EngineSettings,
    state: PipelineState,
    current: Option<NodeId>,
    started: bool,
    awaiting: bool,
    cycles: u64,
    checkpoints: Option<Checkpointing>,
    cancel: CancellationToken,
}

impl GraphEngine {
    pub fn new(
        graph: Graph,
        executor: TaskExecutor,
        memory: Arc<MemoryManager>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            graph,
            executor,
            memory,
            settings,
            state: PipelineState::new(),
            current: None,
            started: false,
            awaiting: false,
            cycles: 0,
            checkpoints: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Persist progress for `session_id` through `manager`.
    pub fn with_checkpoints(mut self, manager: Arc<CheckpointManager>, session_id: SessionId) -> Self {
        self.checkpoints = Some(Checkpointing {
            manager,
            session_id,
        });
        self
    }

    /// Validate the graph against the executor's collaborators and freeze it.
    pub fn compile(&mut self) -> Result<()> {
        self.graph.compile()?;
        for node in self.graph.nodes() {
            for tool in node.tool_names() {
                if !self.executor.tools().contains(tool) {
                    return Err(SmartGraphError::Validation(format!(
                        "node '{}' uses unregistered tool '{}'",
                        node.name, tool
                    )));
                }
            }
            if matches!(node.kind, NodeKind::Ai { .. }) && !self.executor.has_model() {
                return Err(SmartGraphError::Configuration(format!(
                    "node '{}' needs a model client",
                    node.name
                )));
            }
        }
        Ok(())
    }

    /// Start a fresh run at the entry node.
    ///
    /// When the entry node is a human node, `entry_input` is its input;
    /// otherwise it is seeded into the pipeline state as `user_input`.
    pub async fn execute(&mut self, entry_input: Option<&str>) -> Result<RunStatus> {
        let entry = self.graph.entry()?;
        let entry_is_human = self.graph.node(entry)?.role == ActorRole::Human;

        self.state = PipelineState::new();
        self.current = Some(entry);
        self.started = true;
        self.awaiting = false;
        self.cycles = 0;
        self.memory.reset_short_term();

        let pending = match entry_input {
            Some(text) if entry_is_human => Some(text.to_string()),
            Some(text) => {
                self.state.set_str("user_input", text);
                None
            }
            None => None,
        };

        info!(entry = %self.graph.node(entry)?.name, "Starting run");
        self.run(pending).await
    }

    /// Deliver input to the human node the engine is suspended at.
    pub async fn resume(&mut self, input: &str) -> Result<RunStatus> {
        if !self.awaiting {
            return Err(SmartGraphError::GraphStructure(
                "engine is not waiting for input".into(),
            ));
        }
        self.run(Some(input.to_string())).await
    }

    /// Continue from the current node without new input, e.g. after a
    /// cancelled run once `reset_cancellation` was called.
    pub async fn continue_run(&mut self) -> Result<RunStatus> {
        if !self.started {
            return Err(SmartGraphError::GraphStructure(
                "no run in progress; call execute() first".into(),
            ));
        }
        self.run(None).await
    }

    /// Move to `node` without touching the pipeline state and run from
    /// there. Lets a caller return to a prompt after a cancelled or failed
    /// run instead of starting over.
    pub async fn rewind_to(&mut self, node: &str) -> Result<RunStatus> {
        self.graph.entry()?;
        let id = self.graph.node_id(node).ok_or_else(|| {
            SmartGraphError::GraphStructure(format!("unknown node '{}'", node))
        })?;
        info!(from = ?self.current_node(), to = node, "Rewinding");
        self.current = Some(id);
        self.started = true;
        self.awaiting = false;
        self.run(None).await
    }

    async fn run(&mut self, mut input: Option<String>) -> Result<RunStatus> {
        let mut emitted = Vec::new();
        let mut steps = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                info!(node = ?self.current_node(), "Run cancelled");
                return Ok(RunStatus::Cancelled);
            }

            let Some(id) = self.current else {
                info!(cycles = self.cycles, "Run complete");
                self.awaiting = false;
                return Ok(RunStatus::Completed(self.state.clone()));
            };
            let node = self.graph.node(id)?.clone();

            if node.role == ActorRole::Human && input.is_none() {
                let prompt = node.input_prompt().unwrap_or("> ").to_string();
                return Ok(self.suspend(node.name, prompt, emitted).await);
            }

            steps += 1;
            if steps > self.settings.max_steps_per_run {
                error!(
                    node = %node.name,
                    limit = self.settings.max_steps_per_run,
                    "Step limit exceeded without reaching a suspension point"
                );
                return Err(SmartGraphError::StepLimitExceeded(
                    self.settings.max_steps_per_run,
                ));
            }

            let node_input = match node.role {
                ActorRole::Human => input.take(),
                _ => None,
            };

            match self.run_node(&node, node_input.as_deref()).await {
                Ok(Some(NodeOutcome::Completed { state, effects })) => {
                    self.state = state;
                    emitted.extend(effects.into_iter().filter_map(|effect| match effect {
                        SideEffect::Emit(text) => Some(text),
                        _ => None,
                    }));
                }
                Ok(Some(NodeOutcome::NeedsInput { prompt })) => {
                    return Ok(self.suspend(node.name, prompt, emitted).await);
                }
                Ok(None) => {
                    info!(node = %node.name, "Run cancelled mid-node, nothing merged");
                    return Ok(RunStatus::Cancelled);
                }
                Err(e) if node.on_failure == FailurePolicy::Skip && e.is_recoverable() => {
                    warn!(node = %node.name, error = %e, "Node failed, skipping with degraded output");
                    self.state
                        .set_str(format!("{}_error", node.name), e.to_string());
                    emitted.push(node.fallback_message.clone());
                }
                Err(e) => {
                    error!(node = %node.name, error = %e, "Node failed, halting run");
                    return Err(e);
                }
            }

            self.awaiting = false;
            self.cycles += 1;
            self.memory.flush_or_warn().await;

            let next = self
                .graph
                .next_edge(id, &self.state)
                .and_then(|edge| self.graph.node_id(&edge.to));
            debug!(
                from = %node.name,
                to = ?next.and_then(|n| self.graph.node(n).ok()).map(|n| n.name.as_str()),
                "Edge selected"
            );
            self.current = next;

            if self.settings.checkpoint_every > 0
                && self.cycles % self.settings.checkpoint_every == 0
            {
                self.checkpoint_or_warn().await;
            }
        }
    }

    async fn suspend(&mut self, node: String, prompt: String, emitted: Vec<String>) -> RunStatus {
        self.awaiting = true;
        debug!(node = %node, "Suspended for input");
        self.checkpoint_or_warn().await;
        RunStatus::AwaitingInput {
            node,
            prompt,
            emitted,
        }
    }

    /// Run one node with retries. `Ok(None)` means the run was cancelled.
    async fn run_node(
        &self,
        node: &CompiledNode,
        input: Option<&str>,
    ) -> Result<Option<NodeOutcome>> {
        let attempts = self.settings.max_retries + 1;
        let mut attempt = 0;

        loop {
            info!(node = %node.name, role = %node.role, attempt, "Executing node");
            let started = Instant::now();

            let result = tokio::select! {
                result = self.executor.execute(node, &self.state, &self.memory, input) => result,
                _ = self.cancel.cancelled() => return Ok(None),
            };

            match result {
                Ok(outcome) => {
                    debug!(
                        node = %node.name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Node execution complete"
                    );
                    return Ok(Some(outcome));
                }
                Err(e) if e.is_recoverable() && attempt + 1 < attempts => {
                    let backoff = backoff_delay(attempt, self.settings.retry_backoff_ms);
                    warn!(
                        node = %node.name,
                        attempt = attempt + 1,
                        max_retries = self.settings.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Node failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => return Ok(None),
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Checkpoints ─────────────────────────────────────────────

    /// Current progress as a checkpointable snapshot.
    pub fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            pipeline_state: self.state.clone(),
            active_node: self.current_node().map(String::from),
            memory: self.memory.snapshot(),
            cycles: self.cycles,
        }
    }

    /// Save a checkpoint now. `Ok(None)` when checkpointing is not configured.
    pub async fn checkpoint(&self) -> Result<Option<Checkpoint>> {
        match &self.checkpoints {
            None => Ok(None),
            Some(cp) => cp
                .manager
                .save(&cp.session_id, self.snapshot())
                .await
                .map(Some),
        }
    }

    async fn checkpoint_or_warn(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Checkpoint not saved, continuing");
        }
    }

    /// Restore pipeline state, position, and memory from `checkpoint`.
    pub fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.graph.entry()?;
        let snapshot = &checkpoint.snapshot;
        let current = match &snapshot.active_node {
            Some(name) => Some(self.graph.node_id(name).ok_or_else(|| {
                SmartGraphError::Checkpoint(format!(
                    "checkpoint names node '{}' which is not in the graph",
                    name
                ))
            })?),
            None => None,
        };

        self.state = snapshot.pipeline_state.clone();
        self.current = current;
        self.cycles = snapshot.cycles;
        self.started = true;
        self.awaiting = match current {
            Some(id) => self.graph.node(id)?.role == ActorRole::Human,
            None => false,
        };
        self.memory.restore(&snapshot.memory);
        info!(
            session = %checkpoint.session_id,
            sequence = checkpoint.sequence,
            node = ?snapshot.active_node,
            "Restored from checkpoint"
        );
        Ok(())
    }

    /// Pick up the session's latest checkpoint, if there is one, and run
    /// until the next suspension or terminal state.
    pub async fn resume_session(&mut self) -> Result<Option<RunStatus>> {
        let Some(cp) = &self.checkpoints else {
            return Ok(None);
        };
        let (manager, session_id) = (cp.manager.clone(), cp.session_id.clone());

        let Some(checkpoint) = manager.load(&session_id).await? else {
            return Ok(None);
        };
        self.restore(&checkpoint)?;
        self.run(None).await.map(Some)
    }

    /// End the session: persist memory and write a final checkpoint.
    pub async fn exit(&mut self) -> Result<Option<Checkpoint>> {
        self.memory.flush_or_warn().await;
        let checkpoint = self.checkpoint().await?;
        info!(cycles = self.cycles, "Session exited");
        Ok(checkpoint)
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Name of the node the engine is at, if a run is in progress.
    pub fn current_node(&self) -> Option<&str> {
        self.current
            .and_then(|id| self.graph.node(id).ok())
            .map(|n| n.name.as_str())
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.awaiting
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.checkpoints.as_ref().map(|cp| &cp.session_id)
    }

    /// Token that cancels the in-flight node and stops the loop.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Replace a fired cancellation token so the engine can run again.
    pub fn reset_cancellation(&mut self) {
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::FileCheckpointStore;
    use crate::graph::{Condition, Edge, Node};
    use serde_json::json;
    use smartgraph_core::types::Completion;
    use smartgraph_memory::MemorySettings;
    use smartgraph_test_utils::{paris_records, temp_dir, MockModel, MockTool};
    use smartgraph_tools::ToolRegistry;

    fn settings() -> EngineSettings {
        EngineSettings {
            max_retries: 1,
            retry_backoff_ms: 0,
            max_steps_per_run: 20,
            checkpoint_every: 1,
        }
    }

    fn engine(graph: Graph, model: Option<MockModel>, tools: Vec<MockTool>) -> GraphEngine {
        let mut registry = ToolRegistry::new();
        for tool in tools {
            registry.register(tool);
        }
        let model = model.map(|m| Arc::new(m) as Arc<dyn smartgraph_core::traits::ModelClient>);
        let executor = TaskExecutor::new(model, Arc::new(registry), 512);
        GraphEngine::new(
            graph,
            executor,
            MemoryManager::shared(MemorySettings::default()),
            settings(),
        )
    }

    fn search_loop() -> Graph {
        let mut g = Graph::new();
        g.add_node(Node::human("get_query").with_prompt("Search: "))
            .unwrap();
        g.add_node(Node::tool("search", "web_search")).unwrap();
        g.add_node(
            Node::ai("present_results")
                .with_prompt("Summarize the results for '{user_input}':\n{search_results}")
                .emitting(),
        )
        .unwrap();
        g.add_edge(Edge::always("get_query", "search")).unwrap();
        g.add_edge(Edge::always("search", "present_results")).unwrap();
        g.add_edge(Edge::always("present_results", "get_query"))
            .unwrap();
        g.set_entry("get_query").unwrap();
        g
    }

    fn summarizer() -> MockModel {
        MockModel::responding(|req| {
            let query = req
                .prompt
                .split('\'')
                .nth(1)
                .unwrap_or("")
                .to_string();
            Completion::text(format!("Top result for {}: Paris.", query))
        })
    }

    #[tokio::test]
    async fn test_execute_uncompiled_fails() {
        let mut e = engine(search_loop(), Some(summarizer()), vec![MockTool::new("web_search")]);
        assert!(matches!(
            e.execute(None).await,
            Err(SmartGraphError::GraphStructure(_))
        ));
    }

    #[tokio::test]
    async fn test_search_loop_until_exit() {
        let search = MockTool::new("web_search").with_records(paris_records());
        let mut e = engine(search_loop(), Some(summarizer()), vec![search.clone()]);
        e.compile().unwrap();

        let status = e.execute(None).await.unwrap();
        assert_eq!(
            status,
            RunStatus::AwaitingInput {
                node: "get_query".into(),
                prompt: "Search: ".into(),
                emitted: vec![],
            }
        );

        let status = e.resume("capital of France").await.unwrap();
        let RunStatus::AwaitingInput { node, emitted, .. } = status else {
            panic!("expected the loop to return to get_query");
        };
        assert_eq!(node, "get_query");
        assert_eq!(emitted, vec!["Top result for capital of France: Paris."]);
        assert!(!e.state().get("search_results").unwrap().as_array().unwrap().is_empty());
        assert_eq!(e.cycles(), 3);

        let status = e.resume("largest city in Japan").await.unwrap();
        assert!(matches!(status, RunStatus::AwaitingInput { ref node, .. } if node == "get_query"));
        assert_eq!(search.queries(), vec!["capital of France", "largest city in Japan"]);
        assert_eq!(
            e.memory().recent_turns(2),
            vec![
                "user: largest city in Japan",
                "assistant: Top result for largest city in Japan: Paris."
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_when_not_waiting() {
        let mut e = engine(search_loop(), Some(summarizer()), vec![MockTool::new("web_search")]);
        e.compile().unwrap();
        assert!(matches!(
            e.resume("hi").await,
            Err(SmartGraphError::GraphStructure(_))
        ));
    }

    fn ai_search_graph() -> Graph {
        let mut g = Graph::new();
        g.add_node(Node::human("get_query")).unwrap();
        g.add_node(Node::ai("search")).unwrap();
        g.add_edge(Edge::always("get_query", "search")).unwrap();
        g.set_entry("get_query").unwrap();
        g
    }

    #[tokio::test]
    async fn test_model_failure_retried_then_halts() {
        let model = MockModel::always_failing();
        let mut e = engine(ai_search_graph(), Some(model.clone()), vec![]);
        e.compile().unwrap();

        e.execute(None).await.unwrap();
        let err = e.resume("capital of France").await.unwrap_err();

        assert!(matches!(&err, SmartGraphError::Execution { node, .. } if node == "search"));
        assert_eq!(model.call_count(), 2);
        assert!(e.state().get("ai_response").is_none());
        assert_eq!(e.current_node(), Some("search"));
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_retry() {
        let model = MockModel::failing_times(1);
        let mut e = engine(ai_search_graph(), Some(model.clone()), vec![]);
        e.compile().unwrap();

        let status = e.execute(Some("capital of France")).await.unwrap();
        let RunStatus::Completed(state) = status else {
            panic!("expected completion");
        };
        assert_eq!(state.get_str("ai_response"), Some("mock response"));
        assert_eq!(model.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off() {
        let model = MockModel::failing_times(1);
        let mut e = engine(ai_search_graph(), Some(model), vec![]);
        e.settings.retry_backoff_ms = 1_000;
        e.compile().unwrap();

        let started = tokio::time::Instant::now();
        e.execute(Some("q")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_skip_policy_degrades_and_continues() {
        let mut g = Graph::new();
        g.add_node(Node::human("get_query")).unwrap();
        g.add_node(Node::tool("search", "web_search").skip_on_failure())
            .unwrap();
        g.add_node(Node::ai("present_results").emitting()).unwrap();
        g.add_edge(Edge::always("get_query", "search")).unwrap();
        g.add_edge(Edge::always("search", "present_results")).unwrap();
        g.set_entry("get_query").unwrap();

        let failing = MockTool::new("web_search").failing_times(10);
        let mut e = engine(g, Some(MockModel::new()), vec![failing]);
        e.compile().unwrap();
        e.execute(None).await.unwrap();

        let status = e.resume("capital of France").await.unwrap();
        let RunStatus::Completed(state) = status else {
            panic!("expected completion");
        };
        assert!(state
            .get_str("search_error")
            .is_some_and(|msg| msg.contains("mock tool unavailable")));
        assert!(state.get("search_results").is_none());
        assert_eq!(state.get_str("ai_response"), Some("mock response"));
    }

    #[tokio::test]
    async fn test_skip_policy_emits_fallback() {
        let mut g = Graph::new();
        g.add_node(Node::human("get_query")).unwrap();
        g.add_node(Node::tool("search", "web_search").skip_on_failure())
            .unwrap();
        g.add_edge(Edge::always("get_query", "search")).unwrap();
        g.add_edge(Edge::always("search", "get_query")).unwrap();
        g.set_entry("get_query").unwrap();

        let mut e = engine(g, None, vec![MockTool::new("web_search").failing_times(10)]);
        e.compile().unwrap();
        e.execute(None).await.unwrap();
        let RunStatus::AwaitingInput { emitted, .. } = e.resume("q").await.unwrap() else {
            panic!("expected suspension");
        };
        assert_eq!(emitted, vec!["search unavailable, using last known facts"]);
    }

    #[tokio::test]
    async fn test_conditional_branching() {
        let mut g = Graph::new();
        g.add_node(Node::human("ask")).unwrap();
        g.add_node(Node::ai("weather").with_output_key("answer"))
            .unwrap();
        g.add_node(Node::ai("general").with_output_key("answer"))
            .unwrap();
        g.add_edge(Edge::conditional("ask", "weather", r#"user_input contains "weather""#))
            .unwrap();
        g.add_edge(Edge::always("ask", "general")).unwrap();
        g.set_entry("ask").unwrap();

        let model = MockModel::responding(|req| Completion::text(format!("re: {}", req.prompt)));
        let mut e = engine(g, Some(model.clone()), vec![]);
        e.compile().unwrap();

        let RunStatus::Completed(state) = e.execute(Some("weather in Paris")).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(state.get_str("answer"), Some("re: weather in Paris"));
        assert_eq!(model.call_count(), 1);

        let RunStatus::Completed(state) = e.execute(Some("hello")).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(state.get_str("answer"), Some("re: hello"));
        assert!(state.get("weather").is_none());
    }

    #[tokio::test]
    async fn test_step_limit() {
        let mut g = Graph::new();
        g.add_node(Node::ai("a").with_output_key("a_out")).unwrap();
        g.add_node(Node::ai("b").with_output_key("b_out")).unwrap();
        g.add_edge(Edge::always("a", "b")).unwrap();
        g.add_edge(Edge::always("b", "a")).unwrap();
        g.set_entry("a").unwrap();

        let mut e = engine(g, Some(MockModel::new()), vec![]);
        e.settings.max_steps_per_run = 5;
        e.compile().unwrap();
        assert!(matches!(
            e.execute(Some("go")).await,
            Err(SmartGraphError::StepLimitExceeded(5))
        ));
    }

    #[tokio::test]
    async fn test_non_human_entry_seeds_user_input() {
        let mut g = Graph::new();
        g.add_node(Node::tool("search", "web_search")).unwrap();
        g.set_entry("search").unwrap();

        let tool = MockTool::new("web_search").with_records(paris_records());
        let mut e = engine(g, None, vec![tool.clone()]);
        e.compile().unwrap();
        let RunStatus::Completed(state) = e.execute(Some("capital of France")).await.unwrap() else {
            panic!("expected completion");
        };
        assert_eq!(state.get_str("user_input"), Some("capital of France"));
        assert_eq!(tool.queries(), vec!["capital of France"]);
    }

    #[tokio::test]
    async fn test_compile_checks_collaborators() {
        let mut e = engine(search_loop(), Some(summarizer()), vec![]);
        assert!(matches!(e.compile(), Err(SmartGraphError::Validation(msg)) if msg.contains("web_search")));

        let mut e = engine(search_loop(), None, vec![MockTool::new("web_search")]);
        assert!(matches!(e.compile(), Err(SmartGraphError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_in_flight_node() {
        let slow = MockModel::new().with_delay(Duration::from_secs(300), 600);
        let mut e = engine(ai_search_graph(), Some(slow), vec![]);
        e.compile().unwrap();

        let token = e.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let status = e.execute(Some("q")).await.unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(e.current_node(), Some("search"));
        assert!(e.state().get("ai_response").is_none());

        // Still cancelled until reset.
        assert_eq!(e.continue_run().await.unwrap(), RunStatus::Cancelled);
        e.reset_cancellation();
        e.settings.max_steps_per_run = 5;
        let status = e.continue_run().await.unwrap();
        assert!(matches!(status, RunStatus::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewind_after_cancel_keeps_state() {
        let slow = MockModel::new().with_delay(Duration::from_secs(300), 600);
        let search = MockTool::new("web_search").with_records(paris_records());
        let mut e = engine(search_loop(), Some(slow), vec![search.clone()]);
        e.compile().unwrap();
        e.execute(None).await.unwrap();

        let token = e.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });
        let status = e.resume("capital of France").await.unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(e.current_node(), Some("present_results"));

        e.reset_cancellation();
        let status = e.rewind_to("get_query").await.unwrap();
        assert!(matches!(status, RunStatus::AwaitingInput { ref node, .. } if node == "get_query"));
        assert!(e.is_awaiting_input());
        assert_eq!(e.state().get_str("user_input"), Some("capital of France"));
        assert!(e.state().get("search_results").is_some());
        assert_eq!(search.queries().len(), 1);

        assert!(matches!(
            e.rewind_to("nowhere").await,
            Err(SmartGraphError::GraphStructure(_))
        ));
    }

    #[tokio::test]
    async fn test_checkpoint_at_suspension_and_resume_session() {
        let dir = temp_dir();
        let manager = Arc::new(CheckpointManager::new(Arc::new(FileCheckpointStore::new(
            dir.path(),
        ))));
        let session = SessionId::parse("user-1").unwrap();

        let tools = vec![MockTool::new("web_search").with_records(paris_records())];
        let mut first = engine(search_loop(), Some(summarizer()), tools.clone())
            .with_checkpoints(manager.clone(), session.clone());
        first.compile().unwrap();
        first.execute(None).await.unwrap();
        first.resume("capital of France").await.unwrap();

        let saved = manager.load(&session).await.unwrap().unwrap();
        assert_eq!(saved.snapshot.active_node.as_deref(), Some("get_query"));
        assert_eq!(saved.snapshot.pipeline_state, *first.state());
        assert_eq!(saved.snapshot.cycles, 3);

        let mut second = engine(search_loop(), Some(summarizer()), tools)
            .with_checkpoints(manager.clone(), session.clone());
        second.compile().unwrap();
        let status = second.resume_session().await.unwrap().unwrap();
        assert!(matches!(status, RunStatus::AwaitingInput { ref node, .. } if node == "get_query"));
        assert_eq!(
            second.state().get_str("user_input"),
            Some("capital of France")
        );
        assert_eq!(
            second.memory().conversation_history(),
            first.memory().conversation_history()
        );

        let RunStatus::AwaitingInput { emitted, .. } = second.resume("capital of Italy").await.unwrap() else {
            panic!("expected suspension");
        };
        assert_eq!(emitted, vec!["Top result for capital of Italy: Paris."]);

        let last = second.exit().await.unwrap().unwrap();
        assert!(last.sequence > saved.sequence);
    }

    #[tokio::test]
    async fn test_resume_session_without_checkpoint() {
        let dir = temp_dir();
        let manager = Arc::new(CheckpointManager::new(Arc::new(FileCheckpointStore::new(
            dir.path(),
        ))));
        let mut e = engine(search_loop(), Some(summarizer()), vec![MockTool::new("web_search")])
            .with_checkpoints(manager, SessionId::parse("fresh").unwrap());
        e.compile().unwrap();
        assert!(e.resume_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let dir = temp_dir();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let manager = Arc::new(CheckpointManager::new(Arc::new(FileCheckpointStore::new(
            &blocker,
        ))));

        let mut e = engine(search_loop(), Some(summarizer()), vec![MockTool::new("web_search")])
            .with_checkpoints(manager, SessionId::parse("s").unwrap());
        e.compile().unwrap();
        let status = e.execute(None).await.unwrap();
        assert!(matches!(status, RunStatus::AwaitingInput { .. }));
        assert!(e.checkpoint().await.is_err());
    }

    #[tokio::test]
    async fn test_restore_rejects_unknown_node() {
        let mut e = engine(search_loop(), Some(summarizer()), vec![MockTool::new("web_search")]);
        e.compile().unwrap();
        let checkpoint = Checkpoint {
            version: crate::checkpoint::CHECKPOINT_VERSION,
            session_id: SessionId::parse("s").unwrap(),
            sequence: 1,
            timestamp: chrono::Utc::now(),
            snapshot: ExecutionSnapshot {
                active_node: Some("gone".into()),
                ..Default::default()
            },
        };
        assert!(matches!(
            e.restore(&checkpoint),
            Err(SmartGraphError::Checkpoint(_))
        ));
    }

    #[tokio::test]
    async fn test_long_term_memory_flushed_each_cycle() {
        let dir = temp_dir();
        let path = dir.path().join("long_term.json");
        let memory = MemoryManager::shared(MemorySettings {
            long_term_path: Some(path.clone()),
            ..Default::default()
        });
        let executor = TaskExecutor::new(None, Arc::new(ToolRegistry::new()), 512);
        let mut g = Graph::new();
        g.add_node(Node::human("get_query")).unwrap();
        g.add_edge(Edge::always("get_query", "get_query")).unwrap();
        g.set_entry("get_query").unwrap();

        let mut e = GraphEngine::new(g, executor, memory, settings());
        e.compile().unwrap();
        e.execute(None).await.unwrap();
        e.resume("remember me").await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("user: remember me"));
    }

    #[tokio::test]
    async fn test_condition_on_results_routes_back() {
        let mut g = Graph::new();
        g.add_node(Node::human("get_query")).unwrap();
        g.add_node(Node::tool("search", "web_search")).unwrap();
        g.add_node(Node::ai("present_results").emitting()).unwrap();
        g.add_edge(Edge::when(
            "search",
            "present_results",
            Condition::truthy("search_results"),
        ))
        .unwrap();
        g.add_edge(Edge::always("search", "get_query")).unwrap();
        g.add_edge(Edge::always("get_query", "search")).unwrap();
        g.set_entry("get_query").unwrap();

        let mut e = engine(g, Some(MockModel::new()), vec![MockTool::new("web_search")]);
        e.compile().unwrap();
        e.execute(None).await.unwrap();
        let RunStatus::AwaitingInput { emitted, .. } = e.resume("nothing matches").await.unwrap() else {
            panic!("expected suspension");
        };
        assert!(emitted.is_empty());
        assert_eq!(e.state().get("search_results"), Some(&json!([])));
    }
}
