pub mod gemini;
pub mod ollama;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::AppError;
use crate::models::{FileRef, GenerationParams, GroundingMetadata, Message, MessageRole, TokenUsage};

pub use gemini::{GeminiClient, GeminiClientConfig};
pub use ollama::OllamaAgentService;

/// One streamed delta, tagged by the class of text it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamChunk {
    Thinking(String),
    Answer(String),
}

/// Producer half of the bounded channel between a generation call and the
/// typing scheduler. Sending waits while the channel is full.
#[derive(Clone)]
pub struct ChunkSink {
    tx: mpsc::Sender<StreamChunk>,
    delivered: Arc<Delivered>,
}

#[derive(Default)]
struct Delivered {
    thinking: AtomicBool,
    answer: AtomicBool,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<StreamChunk>) -> Self {
        Self { tx, delivered: Arc::default() }
    }

    /// Fails with [`AppError::Cancelled`] once the consumer has gone away.
    pub async fn send(&self, chunk: StreamChunk) -> Result<(), AppError> {
        let flag = match &chunk {
            StreamChunk::Thinking(_) => &self.delivered.thinking,
            StreamChunk::Answer(_) => &self.delivered.answer,
        };
        self.tx.send(chunk).await.map_err(|_| AppError::Cancelled)?;
        flag.store(true, Ordering::Release);
        Ok(())
    }

    pub fn delivered_thinking(&self) -> bool {
        self.delivered.thinking.load(Ordering::Acquire)
    }

    pub fn delivered_answer(&self) -> bool {
        self.delivered.answer.load(Ordering::Acquire)
    }

    /// `on_chunk(answer, thinking)` in one call; empty deltas are skipped.
    pub async fn deliver(&self, answer: &str, thinking: Option<&str>) -> Result<(), AppError> {
        if let Some(thinking) = thinking.filter(|t| !t.is_empty()) {
            self.send(StreamChunk::Thinking(thinking.to_string())).await?;
        }
        if !answer.is_empty() {
            self.send(StreamChunk::Answer(answer.to_string())).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Oldest first; the last entry is the active user message.
    pub history: Vec<Message>,
    pub system_instruction: Option<String>,
    pub params: GenerationParams,
    /// Extra file references for the active message.
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub thinking: Option<String>,
    pub usage: Option<TokenUsage>,
    pub grounding: Option<GroundingMetadata>,
}

/// Remote text-generation service.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    fn backend(&self) -> &str;

    fn model(&self) -> &str;

    fn has_credentials(&self) -> bool;

    /// Without a sink the call resolves with the whole result at once. With
    /// one, deltas are pushed to it before the call resolves; the result
    /// still carries the full text.
    async fn generate(
        &self,
        request: GenerationRequest,
        on_chunk: Option<ChunkSink>,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, AppError>;

    async fn count_tokens(&self, history: &[Message]) -> Result<u32, AppError>;
}

/// Messages a backend may replay. Thinking and system records are never sent,
/// nor are empty records left behind by failed turns.
pub fn replayable(history: &[Message]) -> Vec<&Message> {
    history
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Model))
        .filter(|m| !m.content.is_empty() || !m.files.is_empty())
        .collect()
}

/// Splits replayable history into prior context and the active message.
pub fn split_active<'a>(history: &'a [Message]) -> (Vec<&'a Message>, Option<&'a Message>) {
    let mut messages = replayable(history);
    let ends_with_user = messages.last().is_some_and(|m| m.role == MessageRole::User);
    let active = if ends_with_user { messages.pop() } else { None };
    (messages, active)
}

/// The instruction rides on the user content instead of the service's
/// dedicated instruction field.
pub fn with_instruction(instruction: Option<&str>, content: &str) -> String {
    match instruction.map(str::trim).filter(|i| !i.is_empty()) {
        Some(instruction) => format!("{instruction}\n\n{content}"),
        None => content.to_string(),
    }
}
