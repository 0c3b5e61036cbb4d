use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Unknown tool: {0}")]
    ToolNotFound(String),
    #[error("Invalid tool input: {0}")]
    InvalidToolInput(String),
    #[error("Tool `{name}` failed: {message}")]
    Tool { name: String, message: String },
    #[error("Tool `{name}` timed out after {timeout_secs}s")]
    ToolTimeout { name: String, timeout_secs: u64 },
    #[error("Provider error: {0}")]
    Provider(String),
    #[error("Provider call timed out after {0}s")]
    ProviderTimeout(u64),
}

impl AgentError {
    /// Stable, client-safe code for this failure. Raw provider/tool text
    /// must never be surfaced over the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::ToolNotFound(_) => "unknown_tool",
            Self::InvalidToolInput(_) => "invalid_tool_input",
            Self::Tool { .. } => "tool_failed",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::Provider(_) => "completion_failed",
            Self::ProviderTimeout(_) => "completion_timeout",
        }
    }
}
