use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use smartgraph_core::config::ModelConfig;
use smartgraph_core::error::{Result, SmartGraphError};
use smartgraph_core::traits::ModelClient;
use smartgraph_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat-completions client. Works with OpenAI, Ollama,
/// vLLM, Groq, OpenRouter, etc.
pub struct OpenAiClient {
    http: Client,
    config: ModelConfig,
}

impl OpenAiClient {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }
}

// Request types
#[derive(Serialize, Debug)]
pub(crate) struct ChatRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
}

#[derive(Serialize, Debug)]
pub(crate) struct OaiMessage {
    role: String,
    content: String,
}

#[derive(Serialize, Debug)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize, Debug)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
pub(crate) struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OaiToolCall>,
}

#[derive(Deserialize, Debug)]
struct OaiToolCall {
    #[serde(default)]
    id: String,
    function: OaiFunction,
}

#[derive(Deserialize, Debug)]
struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Build the request body: optional system message, then one user message
/// carrying context, tool results, and the prompt.
pub(crate) fn build_request(config: &ModelConfig, request: &CompletionRequest) -> ChatRequest {
    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(OaiMessage {
            role: "system".to_string(),
            content: system.clone(),
        });
    }

    let mut user = String::new();
    if let Some(context) = request.context.as_deref().filter(|c| !c.is_empty()) {
        user.push_str("## Context\n\n");
        user.push_str(context);
        user.push_str("\n\n---\n\n");
    }
    if !request.tool_results.is_empty() {
        user.push_str("## Tool results\n\n");
        for result in &request.tool_results {
            user.push_str(&result.render());
            user.push_str("\n\n");
        }
        user.push_str("---\n\n");
    }
    user.push_str(&request.prompt);
    messages.push(OaiMessage {
        role: "user".to_string(),
        content: user,
    });

    let tools = request
        .tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect();

    ChatRequest {
        model: config.model_id.clone(),
        messages,
        max_tokens: config.max_tokens,
        temperature: if config.temperature > 0.0 {
            Some(config.temperature)
        } else {
            None
        },
        tools,
    }
}

pub(crate) fn parse_response(response: ChatResponse) -> Result<Completion> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| SmartGraphError::ModelRequest("response has no choices".into()))?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|call| {
            let query = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
                .ok()
                .and_then(|args| args.get("query").and_then(|q| q.as_str()).map(String::from))
                .unwrap_or_else(|| {
                    warn!(tool = %call.function.name, "Tool call arguments missing 'query'");
                    call.function.arguments.clone()
                });
            ToolInvocation {
                id: call.id,
                tool: call.function.name,
                query,
            }
        })
        .collect();

    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage: response.usage.map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
            cost_usd: None,
        }),
    })
}

impl ModelClient for OpenAiClient {
    fn complete(&self, request: CompletionRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            let url = self.config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let body = build_request(&self.config, &request);

            let mut req = self.http.post(url).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let response = req
                .send()
                .await
                .map_err(|e| SmartGraphError::ModelRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown error".to_string());
                return Err(SmartGraphError::ModelRequest(format!(
                    "HTTP {}: {}",
                    status, body
                )));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| SmartGraphError::ModelRequest(e.to_string()))?;
            let completion = parse_response(parsed)?;
            debug!(
                model = %self.config.model_id,
                chars = completion.text.len(),
                tool_calls = completion.tool_calls.len(),
                "Model call complete"
            );
            Ok(completion)
        })
    }

    fn timeout_secs(&self) -> u64 {
        self.config.timeout_secs
    }
}
