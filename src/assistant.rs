use serde_json::json;

use smartgraph_core::error::Result;
use smartgraph_engine::{Condition, Edge, Graph, Node};

const SYSTEM: &str = "You are a concise research assistant. Answer from the search \
results and known facts; say so when they do not contain the answer.";

const PRESENT_PROMPT: &str = "Question: {user_input}\n\nSearch results:\n{search_results}\n\n\
Answer the question in two or three sentences.";

/// The human node the loop returns to between queries.
pub const PROMPT_NODE: &str = "get_query";

/// The interactive search loop:
/// `get_query -> search -> present_results -> get_query`.
///
/// A failed or empty search skips the summary and goes straight back to
/// the prompt.
pub fn build_graph(search_tool: &str, max_results: usize) -> Result<Graph> {
    let mut graph = Graph::new();

    graph.add_node(Node::human(PROMPT_NODE).with_prompt("\nsearch> "))?;
    graph.add_node(
        Node::tool("search", search_tool)
            .with("max_results", max_results)
            .with(
                "fallback_message",
                "Search is unavailable right now, try again shortly.",
            )
            .skip_on_failure(),
    )?;
    graph.add_node(
        Node::ai("present_results")
            .with_prompt(PRESENT_PROMPT)
            .with("system", SYSTEM)
            .with("tools", json!(["memory_recall"]))
            .with("max_tool_rounds", 1)
            .with("max_results", max_results)
            .emitting(),
    )?;

    graph.add_edge(Edge::always(PROMPT_NODE, "search"))?;
    graph.add_edge(Edge::when(
        "search",
        "present_results",
        Condition::truthy("search_results"),
    ))?;
    graph.add_edge(Edge::always("search", PROMPT_NODE))?;
    graph.add_edge(Edge::always("present_results", PROMPT_NODE))?;
    graph.set_entry(PROMPT_NODE)?;

    Ok(graph)
}
