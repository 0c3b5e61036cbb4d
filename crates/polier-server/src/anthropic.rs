//! Anthropic Messages API client.
//!
//! Implements [`CompletionProvider`] over the non-streaming
//! `/v1/messages` endpoint. Upstream failure detail is logged here at
//! the service boundary and reduced to a classified error; raw provider
//! text never travels further.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use polier_agent::errors::{AgentError, Result};
use polier_agent::provider::{
    CompletionProvider, CompletionRequest, CompletionResponse, ContentBlock, MessageContent,
    ProviderMessage, ToolSchema,
};

use crate::config::ProviderConfig;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    client: Client,
    config: ProviderConfig,
}

impl std::fmt::Debug for AnthropicClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicClient")
            .field("model", &self.config.model)
            .field("api_key", &"<REDACTED>")
            .finish()
    }
}

impl AnthropicClient {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }
}

/// Wire form of the typed message list.
///
/// Tool results become `tool_result` blocks inside a user message;
/// assistant block lists are serialized verbatim (including opaque
/// blocks, echoed back unchanged).
fn convert_messages(messages: &[ProviderMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|message| {
            let content = match &message.content {
                MessageContent::Text(text) => json!(text),
                MessageContent::Blocks(blocks) => {
                    json!(blocks.iter().map(ContentBlock::to_value).collect::<Vec<_>>())
                }
                MessageContent::ToolResults(results) => json!(results
                    .iter()
                    .map(|result| result.to_value())
                    .collect::<Vec<_>>()),
            };
            json!({ "role": message.role.as_str(), "content": content })
        })
        .collect()
}

fn convert_tools(tools: &[ToolSchema]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "name": tool.name,
                "description": tool.description,
                "input_schema": tool.input_schema,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct MessagesErrorBody {
    error: MessagesErrorDetail,
}

#[derive(Debug, Deserialize)]
struct MessagesErrorDetail {
    message: String,
    #[serde(default, rename = "type")]
    error_type: Option<String>,
}

#[async_trait]
impl CompletionProvider for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        debug!(
            model = %self.config.model,
            message_count = request.messages.len(),
            tool_count = request.tools.len(),
            "requesting completion"
        );

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "messages": convert_messages(&request.messages),
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(convert_tools(&request.tools));
        }

        let response = self
            .client
            .post(format!("{ANTHROPIC_API_BASE}/v1/messages"))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!(error = %err, "completion request failed to send");
                AgentError::Provider("request failed".to_string())
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|err| {
            error!(error = %err, "failed to read completion response body");
            AgentError::Provider("unreadable response".to_string())
        })?;

        if !status.is_success() {
            if let Ok(parsed) = serde_json::from_str::<MessagesErrorBody>(&text) {
                error!(
                    status = %status,
                    error_type = ?parsed.error.error_type,
                    message = %parsed.error.message,
                    "completion request rejected"
                );
            } else {
                error!(status = %status, "completion request rejected");
            }
            return Err(AgentError::Provider(format!("upstream status {status}")));
        }

        let parsed: MessagesResponse = serde_json::from_str(&text).map_err(|err| {
            error!(error = %err, "failed to parse completion response");
            AgentError::Provider("unparseable response".to_string())
        })?;

        Ok(CompletionResponse {
            content: parsed.content.iter().map(ContentBlock::from_value).collect(),
        })
    }
}
