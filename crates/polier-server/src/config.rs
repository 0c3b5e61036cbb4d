//! Process configuration, read from the environment once at startup.
//!
//! Everything downstream receives these structs by reference; no module
//! reads the environment after boot.

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_MAX_TOKENS: usize = 1000;

// "Charlotte": warm tone, reads product names well.
const DEFAULT_VOICE_ID: &str = "XB0fDUnXU5powFXDhCwa";
const DEFAULT_SYNTHESIS_MODEL: &str = "eleven_multilingual_v2";
const DEFAULT_OUTPUT_FORMAT: &str = "mp3_44100_128";

const SYSTEM_PROMPT: &str = "\
You are a voice ordering assistant for a construction jobsite. You help \
a foreman build a purchase list of everyday supplies and consumables \
(screws, tape, gloves, hard hats, drill bits), not major equipment.

Rules:
- Check inventory before ordering: call inventory_search for each \
requested item; if it is already on hand, say what is in stock and ask \
whether to order more anyway.
- Use product_price_search to quote prices; never invent article \
numbers or prices — only use values returned by tools.
- Clarify ambiguous items with minimal follow-up questions, batched \
where possible. Confirm quantities and units; if the user says \
\"a few\", ask for a number.
- Keep responses short and spoken-friendly. No markdown.";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: usize,
    pub system_prompt: String,
}

#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub api_key: Option<String>,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
}

impl SynthesisConfig {
    /// Synthesis is optional: without an API key the server streams
    /// text-only responses and emits no audio frames.
    pub fn enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub provider: ProviderConfig,
    pub synthesis: SynthesisConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = non_empty_env("ANTHROPIC_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("ANTHROPIC_API_KEY is not set"))?;

        Ok(Self {
            provider: ProviderConfig {
                api_key,
                model: non_empty_env("POLIER_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
                max_tokens: non_empty_env("POLIER_MAX_TOKENS")
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(DEFAULT_MAX_TOKENS),
                system_prompt: SYSTEM_PROMPT.to_string(),
            },
            synthesis: SynthesisConfig {
                api_key: non_empty_env("ELEVENLABS_API_KEY"),
                voice_id: non_empty_env("ELEVENLABS_VOICE_ID")
                    .unwrap_or_else(|| DEFAULT_VOICE_ID.to_string()),
                model_id: non_empty_env("ELEVENLABS_MODEL_ID")
                    .unwrap_or_else(|| DEFAULT_SYNTHESIS_MODEL.to_string()),
                output_format: non_empty_env("ELEVENLABS_OUTPUT_FORMAT")
                    .unwrap_or_else(|| DEFAULT_OUTPUT_FORMAT.to_string()),
            },
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}
