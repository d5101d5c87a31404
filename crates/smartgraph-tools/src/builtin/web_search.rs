use futures::future::BoxFuture;
use serde_json::json;

use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::Tool;
use smartgraph_core::types::SearchRecord;

const TAVILY_URL: &str = "https://api.tavily.com/search";

/// Web search through the Tavily API.
pub struct WebSearchTool {
    api_key: String,
    http: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::new(),
        }
    }
}

fn tool_error(message: impl ToString) -> SmartGraphError {
    SmartGraphError::ToolExecution {
        tool: "web_search".into(),
        message: message.to_string(),
    }
}

/// Pull `(title, content, url)` records out of a Tavily response body.
pub(crate) fn parse_results(body: &serde_json::Value) -> Vec<SearchRecord> {
    body["results"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .map(|r| {
                    SearchRecord::new(
                        r["title"].as_str().unwrap_or(""),
                        r["content"].as_str().unwrap_or(""),
                        r["url"].as_str().unwrap_or(""),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns relevant results with snippets."
    }

    fn run(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<SearchRecord>>> {
        let query = query.to_string();
        Box::pin(async move {
            let resp = self
                .http
                .post(TAVILY_URL)
                .json(&json!({
                    "api_key": self.api_key,
                    "query": query,
                    "max_results": max_results,
                }))
                .send()
                .await
                .map_err(tool_error)?;

            if !resp.status().is_success() {
                return Err(tool_error(format!("HTTP {}", resp.status())));
            }

            let body: serde_json::Value = resp.json().await.map_err(tool_error)?;
            Ok(parse_results(&body))
        })
    }
}
