use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::Tool;
use smartgraph_core::types::{SearchRecord, ToolDefinition};

/// Registry of available tools, looked up by name from node config and
/// model tool calls.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_shared(Arc::new(tool));
    }

    /// Register an already shared tool. A tool with the same name is replaced.
    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for the named tools, in the order given. Unknown names
    /// are a `ToolNotFound` error.
    pub fn definitions_for(&self, names: &[String]) -> Result<Vec<ToolDefinition>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|t| t.definition())
                    .ok_or_else(|| SmartGraphError::ToolNotFound(name.clone()))
            })
            .collect()
    }

    /// Run a tool by name, bounded by the tool's timeout.
    pub async fn run(
        &self,
        name: &str,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchRecord>> {
        let tool = self
            .get(name)
            .ok_or_else(|| SmartGraphError::ToolNotFound(name.to_string()))?;

        let timeout = Duration::from_secs(tool.timeout_secs());
        debug!(tool = %name, query = %query, max_results, "Running tool");

        match tokio::time::timeout(timeout, tool.run(query, max_results)).await {
            Ok(Ok(mut records)) => {
                records.truncate(max_results);
                Ok(records)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SmartGraphError::Timeout {
                what: format!("tool {}", name),
                timeout_secs: tool.timeout_secs(),
            }),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
