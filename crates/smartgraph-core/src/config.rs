use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SmartGraphError};

/// Top-level SmartGraph configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub model: Option<ModelConfig>,
    #[serde(default)]
    pub search: Option<SearchConfig>,
}

/// Short- and long-term memory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum number of entries kept in `conversation_history`.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Conversation turns included in model context.
    #[serde(default = "default_context_turns")]
    pub context_turns: usize,
    /// Word budget for assembled context.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Where long-term memory is persisted. `None` keeps it in memory only.
    #[serde(default)]
    pub long_term_path: Option<String>,
    /// Idle time after which long-term entries are evicted at startup.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            context_turns: default_context_turns(),
            max_context_tokens: default_max_context_tokens(),
            long_term_path: None,
            ttl_secs: None,
        }
    }
}

fn default_history_cap() -> usize { 50 }
fn default_context_turns() -> usize { 5 }
fn default_max_context_tokens() -> usize { 512 }

/// Control-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Extra attempts for a failed node before its failure policy applies.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Node executions allowed between two suspension points.
    #[serde(default = "default_max_steps_per_run")]
    pub max_steps_per_run: usize,
    /// Save a checkpoint every N completed cycles (0 = only at suspension points).
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_steps_per_run: default_max_steps_per_run(),
            checkpoint_every: default_checkpoint_every(),
        }
    }
}

fn default_max_retries() -> u32 { 1 }
fn default_retry_backoff_ms() -> u64 { 200 }
fn default_max_steps_per_run() -> usize { 100 }
fn default_checkpoint_every() -> u64 { 1 }

/// Checkpoint storage backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackend {
    #[default]
    File,
    Sqlite,
}

/// Checkpoint / resume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_checkpoint_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub backend: CheckpointBackend,
    /// Directory for checkpoint files (or the SQLite database).
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: default_checkpoint_enabled(),
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
        }
    }
}

fn default_checkpoint_enabled() -> bool { true }
fn default_checkpoint_dir() -> String { "checkpoints".to_string() }

/// Model-call collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
}

fn default_provider() -> String { "openai".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_temperature() -> f32 { 0.7 }
fn default_model_timeout() -> u64 { 60 }

/// Search provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchProvider {
    #[default]
    Tavily,
    DuckDuckGo,
}

/// Search tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub provider: SearchProvider,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_max_results() -> usize { 5 }

impl AppConfig {
    /// Load config from a TOML file, expanding `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| SmartGraphError::ConfigNotFound(path.display().to_string()))?;
        Self::parse(&content)
    }

    /// Parse config text, expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).map_err(|e| SmartGraphError::Config(e.to_string()))
    }

    /// Resolved long-term memory path (expands `~`).
    pub fn long_term_path(&self) -> Option<PathBuf> {
        self.memory.long_term_path.as_deref().map(expand_home)
    }

    /// Resolved checkpoint directory (expands `~`).
    pub fn checkpoint_dir(&self) -> PathBuf {
        expand_home(&self.checkpoint.dir)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string. Unset variables expand to "".
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    tracing::warn!(var = %var_name, "Environment variable not set, expanding to empty");
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}
