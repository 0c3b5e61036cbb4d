//! Shared application state.

use std::sync::Arc;

use tokio::sync::Semaphore;

use polier_agent::engine::{CompletionEngine, EngineConfig};
use polier_agent::history::MessageHistoryStore;
use polier_agent::provider::CompletionProvider;
use polier_agent::tools::ToolRegistry;

use crate::anthropic::AnthropicClient;
use crate::catalog::CatalogStore;
use crate::config::{ServerConfig, SynthesisConfig};
use crate::tools::build_registry;

/// Shared application state; every field is a cheap clone.
#[derive(Clone)]
pub struct AppState {
    /// Completion loop shared by all connections.
    pub engine: Arc<CompletionEngine>,
    /// In-memory per-conversation message history.
    pub history: Arc<MessageHistoryStore>,
    /// SQLite-backed supplier catalog and inventory.
    pub catalog: Arc<CatalogStore>,
    /// Speech synthesis settings; disabled without credentials.
    pub synthesis: SynthesisConfig,
    /// Concurrency limiter for response generation.
    pub request_semaphore: Arc<Semaphore>,
    /// Shared HTTP client for outbound REST calls.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(CatalogStore::initialize()?);
        let registry = build_registry(Arc::clone(&catalog));
        let provider = Arc::new(AnthropicClient::new(config.provider.clone()));

        let engine_config = EngineConfig {
            system_prompt: config.provider.system_prompt.clone(),
            max_tokens: config.provider.max_tokens,
            ..EngineConfig::default()
        };

        Ok(Self::assemble(
            provider,
            registry,
            engine_config,
            catalog,
            config.synthesis.clone(),
        ))
    }

    /// Wire the state from already-built parts. Lets tests swap in a
    /// scripted provider and a throwaway catalog.
    pub fn assemble(
        provider: Arc<dyn CompletionProvider>,
        registry: ToolRegistry,
        engine_config: EngineConfig,
        catalog: Arc<CatalogStore>,
        synthesis: SynthesisConfig,
    ) -> Self {
        let max_concurrent = std::env::var("MAX_CONCURRENT_REQUESTS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        Self {
            engine: Arc::new(CompletionEngine::new(
                provider,
                Arc::new(registry),
                engine_config,
            )),
            history: Arc::new(MessageHistoryStore::default()),
            catalog,
            synthesis,
            request_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            http: reqwest::Client::new(),
        }
    }
}
