use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use smartgraph_core::error::{Result, SmartGraphError};

/// Who does a node's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    /// Waits for text from the host.
    Human,
    /// Calls the model collaborator.
    Ai,
    /// Calls a registered tool.
    Tool,
}

impl ActorRole {
    fn default_output_key(self) -> &'static str {
        match self {
            ActorRole::Human => "user_input",
            ActorRole::Ai => "ai_response",
            ActorRole::Tool => "search_results",
        }
    }

    fn allowed_keys(self) -> &'static [&'static str] {
        match self {
            ActorRole::Human => &["prompt"],
            ActorRole::Ai => &[
                "prompt",
                "system",
                "query_key",
                "max_context_tokens",
                "tools",
                "max_tool_rounds",
                "max_results",
                "remember",
            ],
            ActorRole::Tool => &["tool", "query_key", "max_results"],
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRole::Human => write!(f, "human"),
            ActorRole::Ai => write!(f, "ai"),
            ActorRole::Tool => write!(f, "tool"),
        }
    }
}

const COMMON_KEYS: &[&str] = &["output_key", "emit", "on_failure", "fallback_message"];

/// A node as declared while building a graph.
///
/// The config payload stays opaque until `Graph::compile` turns it into a
/// `CompiledNode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub role: ActorRole,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: ActorRole) -> Self {
        Self {
            name: name.into(),
            role,
            config: Map::new(),
        }
    }

    pub fn human(name: impl Into<String>) -> Self {
        Self::new(name, ActorRole::Human)
    }

    pub fn ai(name: impl Into<String>) -> Self {
        Self::new(name, ActorRole::Ai)
    }

    /// A tool node bound to the named registered tool.
    pub fn tool(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self::new(name, ActorRole::Tool).with("tool", Value::String(tool.into()))
    }

    /// Set one config key.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_prompt(self, prompt: impl Into<String>) -> Self {
        self.with("prompt", prompt.into())
    }

    pub fn with_output_key(self, key: impl Into<String>) -> Self {
        self.with("output_key", key.into())
    }

    pub fn emitting(self) -> Self {
        self.with("emit", true)
    }

    pub fn skip_on_failure(self) -> Self {
        self.with("on_failure", "skip")
    }

    /// Validate the config payload and resolve defaults.
    pub fn compile(&self) -> Result<CompiledNode> {
        let cfg = ConfigReader {
            node: &self.name,
            map: &self.config,
        };

        for key in self.config.keys() {
            if !COMMON_KEYS.contains(&key.as_str())
                && !self.role.allowed_keys().contains(&key.as_str())
            {
                return Err(cfg.invalid(key, &format!("not a {} node setting", self.role)));
            }
        }

        let on_failure = match cfg.string("on_failure")?.as_deref() {
            None | Some("halt") => FailurePolicy::Halt,
            Some("skip") => FailurePolicy::Skip,
            Some(_) => return Err(cfg.invalid("on_failure", "expected \"halt\" or \"skip\"")),
        };

        let kind = match self.role {
            ActorRole::Human => NodeKind::Human {
                prompt: cfg.string("prompt")?.unwrap_or_else(|| "> ".to_string()),
            },
            ActorRole::Ai => NodeKind::Ai {
                max_results: cfg.results_cap()?,
                prompt: cfg
                    .string("prompt")?
                    .unwrap_or_else(|| "{user_input}".to_string()),
                system: cfg.string("system")?,
                query_key: cfg
                    .string("query_key")?
                    .unwrap_or_else(|| "user_input".to_string()),
                max_context_tokens: cfg.count("max_context_tokens")?,
                tools: cfg.string_list("tools")?.unwrap_or_default(),
                max_tool_rounds: cfg.count("max_tool_rounds")?.unwrap_or(2),
                remember: cfg.flag("remember")?.unwrap_or(false),
            },
            ActorRole::Tool => {
                let tool = cfg
                    .string("tool")?
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| cfg.invalid("tool", "required for tool nodes"))?;
                let max_results = cfg.results_cap()?;
                NodeKind::Tool {
                    tool,
                    query_key: cfg
                        .string("query_key")?
                        .unwrap_or_else(|| "user_input".to_string()),
                    max_results,
                }
            }
        };

        let output_key = cfg
            .string("output_key")?
            .unwrap_or_else(|| self.role.default_output_key().to_string());
        if output_key.is_empty() {
            return Err(cfg.invalid("output_key", "must not be empty"));
        }

        Ok(CompiledNode {
            name: self.name.clone(),
            role: self.role,
            output_key,
            emit: cfg.flag("emit")?.unwrap_or(false),
            on_failure,
            fallback_message: cfg
                .string("fallback_message")?
                .unwrap_or_else(|| format!("{} unavailable, using last known facts", self.name)),
            kind,
        })
    }
}

/// What the engine does once a node's retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    Halt,
    Skip,
}

/// Role-specific settings of a compiled node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Human {
        prompt: String,
    },
    Ai {
        prompt: String,
        system: Option<String>,
        query_key: String,
        /// `None` falls back to the memory config budget.
        max_context_tokens: Option<usize>,
        tools: Vec<String>,
        max_tool_rounds: usize,
        /// Cap on records returned by each tool call the model requests.
        max_results: usize,
        remember: bool,
    },
    Tool {
        tool: String,
        query_key: String,
        max_results: usize,
    },
}

/// A validated node with every default resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledNode {
    pub name: String,
    pub role: ActorRole,
    pub output_key: String,
    pub emit: bool,
    pub on_failure: FailurePolicy,
    pub fallback_message: String,
    pub kind: NodeKind,
}

impl CompiledNode {
    /// Prompt shown to the host while a human node waits.
    pub fn input_prompt(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Human { prompt } => Some(prompt),
            _ => None,
        }
    }

    /// Tools this node calls or offers to the model.
    pub fn tool_names(&self) -> Vec<&str> {
        match &self.kind {
            NodeKind::Ai { tools, .. } => tools.iter().map(|t| t.as_str()).collect(),
            NodeKind::Tool { tool, .. } => vec![tool.as_str()],
            NodeKind::Human { .. } => Vec::new(),
        }
    }
}

struct ConfigReader<'a> {
    node: &'a str,
    map: &'a Map<String, Value>,
}

impl ConfigReader<'_> {
    fn invalid(&self, key: &str, reason: &str) -> SmartGraphError {
        SmartGraphError::Validation(format!(
            "node '{}': config key '{}' {}",
            self.node, key, reason
        ))
    }

    fn string(&self, key: &str) -> Result<Option<String>> {
        match self.map.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(self.invalid(key, "must be a string")),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>> {
        match self.map.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(self.invalid(key, "must be a boolean")),
        }
    }

    fn count(&self, key: &str) -> Result<Option<usize>> {
        match self.map.get(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(|n| Some(n as usize))
                .ok_or_else(|| self.invalid(key, "must be a non-negative integer")),
        }
    }

    /// `max_results`, defaulting to 5; zero is rejected.
    fn results_cap(&self) -> Result<usize> {
        match self.count("max_results")?.unwrap_or(5) {
            0 => Err(self.invalid("max_results", "must be at least 1")),
            n => Ok(n),
        }
    }

    fn string_list(&self, key: &str) -> Result<Option<Vec<String>>> {
        match self.map.get(key) {
            None => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(String::from)
                        .ok_or_else(|| self.invalid(key, "must be a list of strings"))
                })
                .collect::<Result<Vec<_>>>()
                .map(Some),
            Some(_) => Err(self.invalid(key, "must be a list of strings")),
        }
    }
}
