use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::ModelClient;
use smartgraph_core::types::*;
use smartgraph_memory::{keys, MemoryManager};
use smartgraph_tools::ToolRegistry;

use crate::graph::state::render_value;
use crate::graph::{CompiledNode, NodeKind, PipelineState};

/// Something a node did besides updating pipeline state.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Text handed back to the host.
    Emit(String),
    MemoryWrite { tier: MemoryTier, key: String },
    ToolCall { tool: String, results: usize },
    ModelCall { usage: Option<Usage> },
}

/// Result of running one node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// The node finished; `state` replaces the engine's pipeline state.
    Completed {
        state: PipelineState,
        effects: Vec<SideEffect>,
    },
    /// A human node has no input yet.
    NeedsInput { prompt: String },
}

/// Runs a single node's unit of work.
///
/// Collaborator failures come back as `Execution { node, .. }` errors, and
/// memory is only written once every external call for the node has
/// succeeded, so a failed attempt leaves no trace.
pub struct TaskExecutor {
    model: Option<Arc<dyn ModelClient>>,
    tools: Arc<ToolRegistry>,
    default_context_tokens: usize,
}

impl TaskExecutor {
    pub fn new(
        model: Option<Arc<dyn ModelClient>>,
        tools: Arc<ToolRegistry>,
        default_context_tokens: usize,
    ) -> Self {
        Self {
            model,
            tools,
            default_context_tokens,
        }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    /// Run `node` against a read-only view of `state`.
    pub async fn execute(
        &self,
        node: &CompiledNode,
        state: &PipelineState,
        memory: &MemoryManager,
        input: Option<&str>,
    ) -> Result<NodeOutcome> {
        match &node.kind {
            NodeKind::Human { prompt } => match input {
                None => Ok(NodeOutcome::NeedsInput {
                    prompt: prompt.clone(),
                }),
                Some(text) => Ok(self.run_human(node, state, memory, text)),
            },
            NodeKind::Ai {
                prompt,
                system,
                query_key,
                max_context_tokens,
                tools,
                max_tool_rounds,
                max_results,
                remember,
            } => {
                let query = state.render(query_key).unwrap_or_default();
                let context = memory.build_context(
                    &query,
                    max_context_tokens.unwrap_or(self.default_context_tokens),
                );
                let request = CompletionRequest {
                    system: system.clone(),
                    prompt: render_template(prompt, state),
                    context: Some(context).filter(|c| !c.is_empty()),
                    tool_results: Vec::new(),
                    tools: self
                        .tools
                        .definitions_for(tools)
                        .map_err(|e| SmartGraphError::execution(&node.name, e))?,
                };

                let mut effects = Vec::new();
                let text = self
                    .complete_with_tools(node, request, *max_tool_rounds, *max_results, &mut effects)
                    .await?;

                let mut next = state.clone();
                next.set_str(&node.output_key, text.as_str());

                memory.update_short_term(keys::LAST_RESPONSE, json!(text));
                memory.record_turn("assistant", &text);
                effects.push(SideEffect::MemoryWrite {
                    tier: MemoryTier::ShortTerm,
                    key: keys::LAST_RESPONSE.into(),
                });
                effects.push(SideEffect::MemoryWrite {
                    tier: MemoryTier::LongTerm,
                    key: keys::CONVERSATION_HISTORY.into(),
                });
                if *remember && memory.add_fact(text.as_str()) {
                    effects.push(SideEffect::MemoryWrite {
                        tier: MemoryTier::LongTerm,
                        key: keys::FACTS.into(),
                    });
                }
                if node.emit {
                    effects.push(SideEffect::Emit(text));
                }

                Ok(NodeOutcome::Completed {
                    state: next,
                    effects,
                })
            }
            NodeKind::Tool {
                tool,
                query_key,
                max_results,
            } => {
                let query = state
                    .render(query_key)
                    .filter(|q| !q.trim().is_empty())
                    .ok_or_else(|| {
                        SmartGraphError::execution(
                            &node.name,
                            format!("no query under '{}'", query_key),
                        )
                    })?;

                let records = self
                    .tools
                    .run(tool, &query, *max_results)
                    .await
                    .map_err(|e| SmartGraphError::execution(&node.name, e))?;
                info!(node = %node.name, tool = %tool, results = records.len(), "Tool call complete");

                let mut effects = vec![SideEffect::ToolCall {
                    tool: tool.clone(),
                    results: records.len(),
                }];
                let value = serde_json::to_value(&records)?;
                if node.emit {
                    effects.push(SideEffect::Emit(render_value(&value)));
                }

                let mut next = state.clone();
                next.set(&node.output_key, value);
                Ok(NodeOutcome::Completed {
                    state: next,
                    effects,
                })
            }
        }
    }

    fn run_human(
        &self,
        node: &CompiledNode,
        state: &PipelineState,
        memory: &MemoryManager,
        text: &str,
    ) -> NodeOutcome {
        let mut next = state.clone();
        next.set_str(&node.output_key, text);

        memory.update_short_term(keys::LAST_INPUT, json!(text));
        memory.record_turn("user", text);

        let mut effects = vec![
            SideEffect::MemoryWrite {
                tier: MemoryTier::ShortTerm,
                key: keys::LAST_INPUT.into(),
            },
            SideEffect::MemoryWrite {
                tier: MemoryTier::LongTerm,
                key: keys::CONVERSATION_HISTORY.into(),
            },
        ];
        if node.emit {
            effects.push(SideEffect::Emit(text.to_string()));
        }
        NodeOutcome::Completed {
            state: next,
            effects,
        }
    }

    /// Call the model, running any tool calls it asks for and feeding the
    /// results back, for at most `max_rounds` tool rounds. The last request
    /// offers no tools so the model has to answer in text.
    async fn complete_with_tools(
        &self,
        node: &CompiledNode,
        mut request: CompletionRequest,
        max_rounds: usize,
        max_results: usize,
        effects: &mut Vec<SideEffect>,
    ) -> Result<String> {
        let model = self.model.as_ref().ok_or_else(|| {
            SmartGraphError::execution(&node.name, "no model client configured")
        })?;
        let offered = std::mem::take(&mut request.tools);
        let mut rounds = 0;

        loop {
            let offer_tools = rounds < max_rounds && !offered.is_empty();
            request.tools = if offer_tools {
                offered.clone()
            } else {
                Vec::new()
            };

            let completion = self.call_model(node, model.as_ref(), request.clone()).await?;
            effects.push(SideEffect::ModelCall {
                usage: completion.usage,
            });

            if !offer_tools || completion.tool_calls.is_empty() {
                return Ok(completion.text);
            }

            rounds += 1;
            for call in completion.tool_calls {
                let output = self.run_requested_tool(node, &call, max_results).await;
                effects.push(SideEffect::ToolCall {
                    tool: call.tool.clone(),
                    results: output.records.len(),
                });
                request.tool_results.push(output);
            }
        }
    }

    async fn call_model(
        &self,
        node: &CompiledNode,
        model: &dyn ModelClient,
        request: CompletionRequest,
    ) -> Result<Completion> {
        let timeout_secs = model.timeout_secs();
        debug!(node = %node.name, tools = request.tools.len(), "Calling model");
        match tokio::time::timeout(Duration::from_secs(timeout_secs), model.complete(request)).await
        {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(e)) => Err(SmartGraphError::execution(&node.name, e)),
            Err(_) => Err(SmartGraphError::execution(
                &node.name,
                SmartGraphError::Timeout {
                    what: "model call".into(),
                    timeout_secs,
                },
            )),
        }
    }

    /// A failing requested tool is reported back to the model, not raised.
    async fn run_requested_tool(
        &self,
        node: &CompiledNode,
        call: &ToolInvocation,
        max_results: usize,
    ) -> ToolOutput {
        match self.tools.run(&call.tool, &call.query, max_results).await {
            Ok(records) => ToolOutput {
                invocation_id: call.id.clone(),
                tool: call.tool.clone(),
                records,
                error: None,
            },
            Err(e) => {
                warn!(node = %node.name, tool = %call.tool, error = %e, "Requested tool failed");
                ToolOutput {
                    invocation_id: call.id.clone(),
                    tool: call.tool.clone(),
                    records: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

/// Replace `{key}` placeholders with rendered pipeline values. Placeholders
/// naming absent keys are left untouched.
pub fn render_template(template: &str, state: &PipelineState) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}');
        let key = close.map(|c| &after[..c]).filter(|k| {
            !k.is_empty() && k.chars().all(|c| c.is_alphanumeric() || c == '_')
        });
        match (key, close) {
            (Some(key), Some(close)) if state.contains(key) => {
                out.push_str(&state.render(key).unwrap_or_default());
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
