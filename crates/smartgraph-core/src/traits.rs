use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Model-call collaborator: prompt in, completion out.
///
/// Transport and quota failures are reported as `ModelRequest` errors;
/// the executor turns them into execution failures of the calling node.
pub trait ModelClient: Send + Sync + 'static {
    /// Send one completion request.
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>>;

    /// Timeout in seconds for one call.
    fn timeout_secs(&self) -> u64 {
        60
    }
}

/// Tool collaborator (e.g. web search): query text in, ranked records out.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in node config and model tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Run the tool.
    fn run(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<SearchRecord>>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }

    /// Definition offered to the model when a node lists this tool.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Query text"
                    }
                },
                "required": ["query"]
            }),
        }
    }
}
