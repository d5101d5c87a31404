//! Tool registry and built-in tools.

pub mod builtin;
pub mod registry;

use std::sync::Arc;

use smartgraph_core::config::{SearchConfig, SearchProvider};
use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::Tool;

pub use builtin::duckduckgo::DuckDuckGoTool;
pub use builtin::memory_recall::MemoryRecallTool;
pub use builtin::web_search::WebSearchTool;
pub use registry::ToolRegistry;

/// Create the configured search tool.
pub fn create_search_tool(config: &SearchConfig) -> Result<Arc<dyn Tool>> {
    match config.provider {
        SearchProvider::Tavily => {
            let api_key = config
                .api_key
                .as_deref()
                .filter(|k| !k.is_empty())
                .ok_or_else(|| {
                    SmartGraphError::Config("search.api_key is required for tavily".into())
                })?;
            Ok(Arc::new(WebSearchTool::new(api_key)))
        }
        SearchProvider::DuckDuckGo => Ok(Arc::new(DuckDuckGoTool::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_search_tool() {
        let ddg = SearchConfig {
            provider: SearchProvider::DuckDuckGo,
            api_key: None,
            max_results: 5,
        };
        assert_eq!(create_search_tool(&ddg).unwrap().name(), "duckduckgo_search");

        let tavily = SearchConfig {
            provider: SearchProvider::Tavily,
            api_key: Some("tvly-test".into()),
            max_results: 5,
        };
        assert_eq!(create_search_tool(&tavily).unwrap().name(), "web_search");

        let keyless = SearchConfig {
            api_key: None,
            ..tavily
        };
        assert!(matches!(
            create_search_tool(&keyless),
            Err(SmartGraphError::Config(_))
        ));
    }
}
