//! The completion loop.
//!
//! Drives one or more round trips with the conversational-model
//! provider for a single turn, executing tool calls between rounds and
//! emitting assistant text chunks through an mpsc sender as they
//! arrive. Bounded by a maximum round count; a provider failure is
//! terminal for the turn, a tool failure is not.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::errors::{AgentError, Result};
use crate::provider::{
    CompletionProvider, CompletionRequest, ContentBlock, MessageContent, MessageRole,
    ProviderMessage, ToolResultBlock,
};
use crate::tools::{stringify_tool_result, ToolRegistry};

const DEFAULT_FALLBACK_TEXT: &str =
    "Sorry, I got stuck looking that up. Could you ask me that again?";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub system_prompt: String,
    pub max_rounds: usize,
    pub provider_timeout: Duration,
    pub tool_timeout: Duration,
    pub max_tokens: usize,
    pub fallback_text: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_rounds: 10,
            provider_timeout: Duration::from_secs(45),
            tool_timeout: Duration::from_secs(10),
            max_tokens: 1000,
            fallback_text: DEFAULT_FALLBACK_TEXT.to_string(),
        }
    }
}

pub struct CompletionEngine {
    provider: Arc<dyn CompletionProvider>,
    tools: Arc<ToolRegistry>,
    config: EngineConfig,
}

impl CompletionEngine {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        tools: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run the loop for one turn. `messages` is the conversation so far,
    /// ending with the new user turn; text chunks are delivered through
    /// `chunk_tx` in provider order. Returns once the provider produces
    /// a tool-free response, the round budget is exhausted (after
    /// emitting the fallback chunk), or the receiver goes away.
    pub async fn run(&self, messages: Vec<ProviderMessage>, chunk_tx: mpsc::Sender<String>) -> Result<()> {
        let mut request = CompletionRequest {
            system: self.config.system_prompt.clone(),
            messages,
            tools: self.tools.schemas(),
            max_tokens: self.config.max_tokens,
        };

        // An empty assistant placeholder at the tail suppresses the
        // provider's own turn generation; never send one.
        if let Some(last) = request.messages.last() {
            if last.role == MessageRole::Assistant && last.content.is_empty() {
                request.messages.pop();
            }
        }

        for round in 1..=self.config.max_rounds {
            let response = match timeout(
                self.config.provider_timeout,
                self.provider.complete(&request),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(AgentError::ProviderTimeout(
                        self.config.provider_timeout.as_secs(),
                    ))
                }
            };

            let mut tool_uses = Vec::new();
            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => {
                        if chunk_tx.send(text.clone()).await.is_err() {
                            // Receiver gone; the turn was superseded.
                            return Ok(());
                        }
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_uses.push((id.clone(), name.clone(), input.clone()));
                    }
                    ContentBlock::Opaque(_) => {}
                }
            }

            if tool_uses.is_empty() {
                return Ok(());
            }

            debug!(round, tool_calls = tool_uses.len(), "executing tool round");
            request.messages.push(ProviderMessage {
                role: MessageRole::Assistant,
                content: MessageContent::Blocks(response.content),
            });

            let mut results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in tool_uses {
                if id.is_empty() {
                    // Without a correlation id the result cannot be
                    // attached to the round; see DESIGN.md.
                    warn!(tool = %name, "dropping tool_use block without an id");
                    continue;
                }
                if name.is_empty() {
                    results.push(ToolResultBlock {
                        tool_use_id: id,
                        content: "tool_use block is missing a tool name".to_string(),
                        is_error: true,
                    });
                    continue;
                }
                results.push(self.dispatch_tool(id, name, input).await);
            }

            request.messages.push(ProviderMessage {
                role: MessageRole::User,
                content: MessageContent::ToolResults(results),
            });
        }

        warn!(
            max_rounds = self.config.max_rounds,
            "completion loop exhausted its round budget"
        );
        let _ = chunk_tx.send(self.config.fallback_text.clone()).await;
        Ok(())
    }

    async fn dispatch_tool(
        &self,
        id: String,
        name: String,
        input: serde_json::Value,
    ) -> ToolResultBlock {
        let outcome = timeout(
            self.config.tool_timeout,
            self.tools.execute(&name, Some(input)),
        )
        .await;

        match outcome {
            Ok(Ok(result)) => ToolResultBlock {
                tool_use_id: id,
                content: stringify_tool_result(&result),
                is_error: false,
            },
            Ok(Err(err)) => {
                warn!(tool = %name, error = %err, "tool call failed");
                ToolResultBlock {
                    tool_use_id: id,
                    content: format!("{}: {err}", err.code()),
                    is_error: true,
                }
            }
            Err(_) => {
                let err = AgentError::ToolTimeout {
                    name,
                    timeout_secs: self.config.tool_timeout.as_secs(),
                };
                warn!(error = %err, "tool call timed out");
                ToolResultBlock {
                    tool_use_id: id,
                    content: format!("{}: {err}", err.code()),
                    is_error: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CompletionResponse;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<CompletionResponse>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<CompletionResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().expect("lock").len()
        }

        fn request(&self, idx: usize) -> CompletionRequest {
            self.requests.lock().expect("lock")[idx].clone()
        }
    }

    #[async_trait]
    impl CompletionProvider for ScriptedProvider {
        async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
            self.requests.lock().expect("lock").push(request.clone());
            self.responses
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| {
                    Ok(CompletionResponse {
                        content: vec![tool_use_block("toolu_loop", "lookup")],
                    })
                })
        }
    }

    struct RecordingTool {
        calls: Arc<Mutex<Vec<Value>>>,
    }

    #[async_trait]
    impl Tool for RecordingTool {
        fn name(&self) -> &'static str {
            "lookup"
        }

        fn description(&self) -> &'static str {
            "Records its input and returns a fixed result."
        }

        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": {}, "required": [] })
        }

        async fn invoke(&self, input: Value) -> Result<Value> {
            self.calls.lock().expect("lock").push(input);
            Ok(json!([{ "artikelname": "Nitrilhandschuhe", "preis_eur": 7.5 }]))
        }
    }

    fn tool_use_block(id: &str, name: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: json!({ "query_text": "gloves" }),
        }
    }

    fn text_block(text: &str) -> ContentBlock {
        ContentBlock::Text {
            text: text.to_string(),
        }
    }

    fn engine_with(
        provider: Arc<ScriptedProvider>,
        calls: Arc<Mutex<Vec<Value>>>,
    ) -> CompletionEngine {
        let mut tools = ToolRegistry::new();
        tools.register(RecordingTool { calls });
        CompletionEngine::new(provider, Arc::new(tools), EngineConfig::default())
    }

    async fn run_and_collect(
        engine: &CompletionEngine,
        messages: Vec<ProviderMessage>,
    ) -> (Result<()>, Vec<String>) {
        let (tx, mut rx) = mpsc::channel(64);
        let outcome = engine.run(messages, tx).await;
        let mut chunks = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            chunks.push(chunk);
        }
        (outcome, chunks)
    }

    #[tokio::test]
    async fn tool_round_then_text_round() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(CompletionResponse {
                content: vec![tool_use_block("toolu_1", "lookup")],
            }),
            Ok(CompletionResponse {
                content: vec![text_block("Work gloves are 7.50 euros a pair.")],
            }),
        ]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(Arc::clone(&provider), Arc::clone(&calls));

        let (outcome, chunks) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("price of gloves?")]).await;

        outcome.expect("loop should succeed");
        assert_eq!(chunks, vec!["Work gloves are 7.50 euros a pair."]);
        assert_eq!(calls.lock().expect("lock").len(), 1);
        assert_eq!(provider.request_count(), 2);

        // Exactly one assistant message and one tool_result message were
        // appended between the two provider calls.
        let first = provider.request(0);
        let second = provider.request(1);
        assert_eq!(second.messages.len(), first.messages.len() + 2);
        match &second.messages[first.messages.len()].content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 1),
            other => panic!("expected assistant blocks, got {other:?}"),
        }
        match &second.messages[first.messages.len() + 1].content {
            MessageContent::ToolResults(results) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].tool_use_id, "toolu_1");
                assert!(!results[0].is_error);
                assert!(results[0].content.contains("Nitrilhandschuhe"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_is_emitted_even_when_tools_are_requested() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(CompletionResponse {
                content: vec![
                    text_block("Let me check the inventory."),
                    tool_use_block("toolu_1", "lookup"),
                ],
            }),
            Ok(CompletionResponse {
                content: vec![text_block("You have twelve pairs on site.")],
            }),
        ]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(provider, calls);

        let (outcome, chunks) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("any gloves left?")]).await;

        outcome.expect("loop should succeed");
        assert_eq!(
            chunks,
            vec!["Let me check the inventory.", "You have twelve pairs on site."]
        );
    }

    #[tokio::test]
    async fn round_budget_exhaustion_yields_single_fallback_chunk() {
        // The scripted provider falls back to an endless tool_use answer.
        let provider = Arc::new(ScriptedProvider::new(Vec::new()));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(Arc::clone(&provider), calls);

        let (outcome, chunks) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("loop forever")]).await;

        outcome.expect("exhaustion is a designed degradation, not an error");
        assert_eq!(provider.request_count(), 10);
        assert_eq!(chunks, vec![DEFAULT_FALLBACK_TEXT]);
    }

    #[tokio::test]
    async fn missing_tool_name_degrades_to_error_result() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(CompletionResponse {
                content: vec![tool_use_block("toolu_1", "")],
            }),
            Ok(CompletionResponse {
                content: vec![text_block("done")],
            }),
        ]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(Arc::clone(&provider), Arc::clone(&calls));

        let (outcome, _) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("hi")]).await;
        outcome.expect("a bad tool_use block must not abort the turn");

        assert!(calls.lock().expect("lock").is_empty());
        let second = provider.request(1);
        match &second.messages.last().expect("tool results").content {
            MessageContent::ToolResults(results) => {
                assert_eq!(results.len(), 1);
                assert!(results[0].is_error);
                assert_eq!(results[0].tool_use_id, "toolu_1");
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_use_without_id_is_skipped() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(CompletionResponse {
                content: vec![
                    tool_use_block("", "lookup"),
                    tool_use_block("toolu_2", "lookup"),
                ],
            }),
            Ok(CompletionResponse {
                content: vec![text_block("done")],
            }),
        ]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(Arc::clone(&provider), calls);

        let (outcome, _) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("hi")]).await;
        outcome.expect("loop should succeed");

        let second = provider.request(1);
        match &second.messages.last().expect("tool results").content {
            MessageContent::ToolResults(results) => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].tool_use_id, "toolu_2");
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_tool_degrades_to_error_result() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Ok(CompletionResponse {
                content: vec![tool_use_block("toolu_1", "draft_upsert_line_item")],
            }),
            Ok(CompletionResponse {
                content: vec![text_block("done")],
            }),
        ]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(Arc::clone(&provider), calls);

        let (outcome, chunks) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("hi")]).await;
        outcome.expect("loop should succeed");
        assert_eq!(chunks, vec!["done"]);

        let second = provider.request(1);
        match &second.messages.last().expect("tool results").content {
            MessageContent::ToolResults(results) => {
                assert!(results[0].is_error);
                assert!(results[0].content.starts_with("unknown_tool"));
            }
            other => panic!("expected tool results, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn trailing_empty_assistant_message_is_dropped() {
        let provider = Arc::new(ScriptedProvider::new(vec![Ok(CompletionResponse {
            content: vec![text_block("hello")],
        })]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(Arc::clone(&provider), calls);

        let messages = vec![
            ProviderMessage::user_text("hello?"),
            ProviderMessage::assistant_text(""),
        ];
        let (outcome, _) = run_and_collect(&engine, messages).await;
        outcome.expect("loop should succeed");

        let first = provider.request(0);
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].role, MessageRole::User);
    }

    #[tokio::test]
    async fn provider_failure_aborts_with_stable_code() {
        let provider = Arc::new(ScriptedProvider::new(vec![Err(AgentError::Provider(
            "upstream 500".to_string(),
        ))]));
        let calls = Arc::new(Mutex::new(Vec::new()));
        let engine = engine_with(provider, calls);

        let (outcome, chunks) =
            run_and_collect(&engine, vec![ProviderMessage::user_text("hi")]).await;
        let err = outcome.unwrap_err();
        assert_eq!(err.code(), "completion_failed");
        assert!(chunks.is_empty());
    }

    struct StalledProvider;

    #[async_trait]
    impl CompletionProvider for StalledProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(CompletionResponse { content: vec![] })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn provider_timeout_is_terminal() {
        let engine = CompletionEngine::new(
            Arc::new(StalledProvider),
            Arc::new(ToolRegistry::new()),
            EngineConfig::default(),
        );

        let (tx, _rx) = mpsc::channel(8);
        let err = engine
            .run(vec![ProviderMessage::user_text("hi")], tx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "completion_timeout");
    }
}
