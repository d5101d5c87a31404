use thiserror::Error;

#[derive(Debug, Error)]
pub enum SmartGraphError {
    // Build-time errors (fatal, raised by compile())
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Graph structure error: {0}")]
    GraphStructure(String),

    // Runtime errors
    #[error("Execution error in node {node}: {cause}")]
    Execution { node: String, cause: String },

    #[error("Step limit exceeded: {0} nodes executed without reaching a suspension point")]
    StepLimitExceeded(usize),

    #[error("Execution cancelled")]
    Cancelled,

    // State errors
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Collaborator errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("{what} timed out after {timeout_secs}s")]
    Timeout { what: String, timeout_secs: u64 },

    // Config file errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SmartGraphError {
    /// Wrap any collaborator failure as an execution failure of `node`.
    pub fn execution(node: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Execution {
            node: node.into(),
            cause: cause.to_string(),
        }
    }

    /// Whether the engine may retry or skip past this error.
    ///
    /// Build-time errors and structure errors always abort the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Execution { .. }
                | Self::ModelRequest(_)
                | Self::ToolExecution { .. }
                | Self::ToolNotFound(_)
                | Self::Timeout { .. }
                | Self::Memory(_)
        )
    }

    /// The node an execution failure is attributed to, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::Execution { node, .. } => Some(node),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SmartGraphError>;
