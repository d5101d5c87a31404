use std::sync::Arc;

use futures::future::BoxFuture;

use smartgraph_core::error::Result;
use smartgraph_core::traits::Tool;
use smartgraph_core::types::SearchRecord;
use smartgraph_memory::{relevant_facts, MemoryManager};

/// Searches the long-term fact list of a session's memory.
///
/// Records carry the fact as both title and snippet and a `memory://facts/<n>`
/// url pointing at the fact's position in the list.
pub struct MemoryRecallTool {
    memory: Arc<MemoryManager>,
}

impl MemoryRecallTool {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self { memory }
    }
}

impl Tool for MemoryRecallTool {
    fn name(&self) -> &str {
        "memory_recall"
    }

    fn description(&self) -> &str {
        "Recall remembered facts relevant to a query, best match first."
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn run(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<SearchRecord>>> {
        let facts = self.memory.facts();
        let records = relevant_facts(&facts, query)
            .into_iter()
            .take(max_results)
            .map(|fact| {
                let position = facts.iter().position(|f| f == fact).unwrap_or(0);
                SearchRecord::new(fact, fact, format!("memory://facts/{}", position))
            })
            .collect();
        Box::pin(async move { Ok(records) })
    }
}
