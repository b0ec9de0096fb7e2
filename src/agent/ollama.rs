use async_trait::async_trait;
use rig::client::Nothing;
use rig::completion::Chat;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{split_active, with_instruction, ChunkSink, GenerationClient, GenerationRequest, GenerationResult};
use crate::errors::AppError;
use crate::models::{Message, MessageRole};

pub const DEFAULT_MODEL: &str = "llama3.2";

/// Builds a rig [`RigMessage`] history list from stored [`Message`] records.
fn to_rig_history(messages: &[&Message]) -> Vec<RigMessage> {
    messages
        .iter()
        .filter_map(|m| match m.role {
            MessageRole::User => Some(RigMessage::user(&m.content)),
            MessageRole::Model => Some(RigMessage::assistant(&m.content)),
            MessageRole::Thinking | MessageRole::System => None,
        })
        .collect()
}

/// Local Ollama backend driven through rig. It answers in one piece: no
/// chunk callbacks, no reasoning stream and no usage metadata.
#[derive(Clone)]
pub struct OllamaAgentService {
    client: ollama::Client,
    base_url: String,
    model: String,
}

impl OllamaAgentService {
    pub fn new(base_url: &str, model: Option<&str>) -> Result<Self, AppError> {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build Ollama client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        })
    }

    fn classify(&self, conversation_id: &str, e: impl std::fmt::Display) -> AppError {
        error!("Ollama inference failed for conversation {conversation_id}: {e}");
        let msg = e.to_string();
        if msg.contains("Connection refused") || msg.contains("connect") {
            AppError::GenerationUnavailable { host: self.base_url.clone() }
        } else {
            AppError::generation(msg)
        }
    }
}

#[async_trait]
impl GenerationClient for OllamaAgentService {
    fn backend(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn has_credentials(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        _on_chunk: Option<ChunkSink>,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, AppError> {
        let (prior, active) = split_active(&request.history);
        let active = active.ok_or_else(|| AppError::EmptyField { field_name: "message".to_string() })?;
        let conversation_id = active.conversation_id.clone();
        let prompt = with_instruction(request.system_instruction.as_deref(), &active.content);

        let agent = self
            .client
            .agent(&self.model)
            .temperature(f64::from(request.params.temperature))
            .build();
        let rig_history = to_rig_history(&prior);

        let content = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            content = agent.chat(prompt.as_str(), rig_history) => {
                content.map_err(|e| self.classify(&conversation_id, e))?
            }
        };

        Ok(GenerationResult { text: content, ..GenerationResult::default() })
    }

    async fn count_tokens(&self, _history: &[Message]) -> Result<u32, AppError> {
        Err(AppError::generation("token counting is not supported by the ollama backend"))
    }
}
