use std::str::FromStr;

use tracing::warn;

use crate::agent::gemini::GeminiClientConfig;
use crate::models::{GenerationParams, SafetyThreshold, SafetyThresholds};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Gemini,
    Ollama,
}

/// Runtime configuration, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backend: Backend,
    pub gemini: GeminiClientConfig,
    pub ollama_base_url: String,
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    pub database_url: Option<String>,
    pub port: u16,
    pub default_params: GenerationParams,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match get("GENERATION_BACKEND").as_deref().map(str::to_lowercase).as_deref() {
            Some("ollama") => Backend::Ollama,
            Some("gemini") | None => Backend::Gemini,
            Some(other) => {
                warn!("Unknown GENERATION_BACKEND '{other}', falling back to gemini");
                Backend::Gemini
            }
        };

        let model = get("MODEL");
        let mut gemini = GeminiClientConfig {
            api_key: get("GEMINI_API_KEY").unwrap_or_default(),
            ..GeminiClientConfig::default()
        };
        if let Some(endpoint) = get("GEMINI_API_BASE_URL") {
            gemini.endpoint = endpoint;
        }
        if let (Backend::Gemini, Some(model)) = (backend, &model) {
            gemini.model = model.clone();
        }

        let defaults = GenerationParams::default();
        let default_params = GenerationParams {
            temperature: parsed(&get, "TEMPERATURE").unwrap_or(defaults.temperature),
            top_p: parsed(&get, "TOP_P").unwrap_or(defaults.top_p),
            top_k: parsed(&get, "TOP_K").unwrap_or(defaults.top_k),
            max_output_tokens: parsed(&get, "MAX_OUTPUT_TOKENS").unwrap_or(defaults.max_output_tokens),
            thinking_enabled: parsed(&get, "THINKING_ENABLED").unwrap_or(defaults.thinking_enabled),
            thinking_budget: parsed(&get, "THINKING_BUDGET").unwrap_or(defaults.thinking_budget),
            include_summaries: parsed(&get, "INCLUDE_SUMMARIES").unwrap_or(defaults.include_summaries),
            streaming_speed_ms: parsed(&get, "STREAMING_SPEED_MS"),
            grounding_enabled: parsed(&get, "GROUNDING_ENABLED").unwrap_or(defaults.grounding_enabled),
            safety: parsed::<SafetyThreshold>(&get, "SAFETY_THRESHOLD")
                .map(SafetyThresholds::uniform)
                .unwrap_or_default(),
        }
        .normalized();

        Self {
            backend,
            gemini,
            ollama_base_url: get("OLLAMA_API_BASE_URL")
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
            system_instruction: get("SYSTEM_INSTRUCTION"),
            database_url: get("DATABASE_URL"),
            port: parsed(&get, "PORT").unwrap_or(8080),
            default_params,
        }
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = get(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring invalid value for {key}: '{raw}'");
            None
        }
    }
}
