pub mod engine;
pub mod errors;
pub mod history;
pub mod provider;
pub mod tools;

pub use engine::{CompletionEngine, EngineConfig};
pub use errors::{AgentError, Result};
pub use history::{HistoryEntry, MessageHistoryStore, Role};
pub use provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, MessageContent,
    MessageRole, ProviderMessage, ToolResultBlock, ToolSchema,
};
pub use tools::{stringify_tool_result, Tool, ToolRegistry};
