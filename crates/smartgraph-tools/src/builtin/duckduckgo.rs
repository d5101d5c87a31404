use futures::future::BoxFuture;
use serde_json::Value;

use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::Tool;
use smartgraph_core::types::SearchRecord;

const DDG_URL: &str = "https://api.duckduckgo.com/";

/// Keyless search through the DuckDuckGo instant-answer API.
pub struct DuckDuckGoTool {
    http: reqwest::Client,
}

impl DuckDuckGoTool {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for DuckDuckGoTool {
    fn default() -> Self {
        Self::new()
    }
}

/// The abstract (when present) followed by related topics, flattening
/// topic groups in order.
pub(crate) fn parse_results(body: &Value, max_results: usize) -> Vec<SearchRecord> {
    let mut records = Vec::new();

    let abstract_text = body["AbstractText"].as_str().unwrap_or("");
    if !abstract_text.is_empty() {
        records.push(SearchRecord::new(
            body["Heading"].as_str().unwrap_or(""),
            abstract_text,
            body["AbstractURL"].as_str().unwrap_or(""),
        ));
    }

    if let Some(topics) = body["RelatedTopics"].as_array() {
        collect_topics(topics, &mut records);
    }

    records.truncate(max_results);
    records
}

fn collect_topics(topics: &[Value], out: &mut Vec<SearchRecord>) {
    for topic in topics {
        if let Some(nested) = topic["Topics"].as_array() {
            collect_topics(nested, out);
            continue;
        }
        let text = match topic["Text"].as_str() {
            Some(t) if !t.is_empty() => t,
            _ => continue,
        };
        // "Title - rest of the snippet"
        let title = text.split(" - ").next().unwrap_or(text);
        out.push(SearchRecord::new(
            title,
            text,
            topic["FirstURL"].as_str().unwrap_or(""),
        ));
    }
}

impl Tool for DuckDuckGoTool {
    fn name(&self) -> &str {
        "duckduckgo_search"
    }

    fn description(&self) -> &str {
        "Search the web using DuckDuckGo"
    }

    fn run(&self, query: &str, max_results: usize) -> BoxFuture<'_, Result<Vec<SearchRecord>>> {
        let query = query.to_string();
        Box::pin(async move {
            let resp = self
                .http
                .get(DDG_URL)
                .query(&[
                    ("q", query.as_str()),
                    ("format", "json"),
                    ("no_html", "1"),
                    ("skip_disambig", "1"),
                ])
                .send()
                .await
                .map_err(|e| SmartGraphError::ToolExecution {
                    tool: "duckduckgo_search".into(),
                    message: e.to_string(),
                })?;

            let body: Value = resp.json().await.map_err(|e| SmartGraphError::ToolExecution {
                tool: "duckduckgo_search".into(),
                message: e.to_string(),
            })?;

            Ok(parse_results(&body, max_results))
        })
    }
}
