//! Gemini client over the public REST API.
//!
//! Streaming uses `streamGenerateContent?alt=sse`; parts flagged `thought`
//! are routed to the reasoning stream, everything else to the answer.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{
    split_active, replayable, with_instruction, ChunkSink, GenerationClient, GenerationRequest,
    GenerationResult, StreamChunk,
};
use crate::errors::AppError;
use crate::models::{
    FileRef, GenerationParams, GroundingMetadata, GroundingSource, Message, MessageRole,
    TokenUsage,
};

/// Gemini client configuration.
#[derive(Debug, Clone)]
pub struct GeminiClientConfig {
    pub api_key: String,
    /// Model name (e.g., "gemini-2.5-flash").
    pub model: String,
    /// Base endpoint URL.
    pub endpoint: String,
    pub connect_timeout_secs: u64,
}

impl Default for GeminiClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-2.5-flash".to_string(),
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiClientConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiClientConfig) -> Result<Self, AppError> {
        // No overall timeout: a long answer stream is only cut by cancellation.
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn build_url(&self, method: &str) -> String {
        let query = if method == "streamGenerateContent" { "alt=sse&" } else { "" };
        format!(
            "{}/models/{}:{}?{}key={}",
            self.config.endpoint, self.config.model, method, query, self.config.api_key
        )
    }

    fn transport_error(&self, e: reqwest::Error) -> AppError {
        if e.is_connect() {
            AppError::GenerationUnavailable { host: self.config.endpoint.clone() }
        } else {
            AppError::generation(e.to_string())
        }
    }

    async fn post<T: Serialize + Sync>(
        &self,
        method: &str,
        body: &T,
    ) -> Result<reqwest::Response, AppError> {
        let response = self
            .client
            .post(self.build_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            error!("Gemini {method} returned HTTP {status}");
            return Err(AppError::generation(format!("HTTP {status}: {text}")));
        }
        Ok(response)
    }

    async fn stream(
        &self,
        body: &GeminiRequest,
        sink: &ChunkSink,
        cancel: &CancellationToken,
    ) -> Result<ResponseAccumulator, AppError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            response = self.post("streamGenerateContent", body) => response?,
        };

        let mut events = response.bytes_stream().eventsource();
        let mut acc = ResponseAccumulator::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AppError::Cancelled),
                next = events.next() => next,
            };
            let event = match next {
                None => break,
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!("Gemini SSE stream error: {e}");
                    return Err(AppError::generation(format!("SSE stream error: {e}")));
                }
            };
            if event.data.trim().is_empty() {
                continue;
            }
            let chunk: GeminiResponse = serde_json::from_str(&event.data).map_err(|e| {
                AppError::generation(format!("SSE parsing error: {e}, data: {}", event.data))
            })?;
            for delta in acc.absorb(chunk)? {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    sent = sink.send(delta) => sent?,
                }
            }
        }
        Ok(acc)
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    fn backend(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    fn has_credentials(&self) -> bool {
        !self.config.api_key.trim().is_empty()
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        on_chunk: Option<ChunkSink>,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, AppError> {
        let body = GeminiRequest::build(&request)?;
        debug!(
            contents = body.contents.len(),
            streaming = on_chunk.is_some(),
            "sending Gemini request"
        );

        let acc = match on_chunk {
            Some(sink) => self.stream(&body, &sink, &cancel).await?,
            None => {
                let response = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    response = self.post("generateContent", &body) => response?,
                };
                let parsed: GeminiResponse = response
                    .json()
                    .await
                    .map_err(|e| AppError::generation(format!("Invalid response body: {e}")))?;
                let mut acc = ResponseAccumulator::default();
                acc.absorb(parsed)?;
                acc
            }
        };
        Ok(acc.finish())
    }

    async fn count_tokens(&self, history: &[Message]) -> Result<u32, AppError> {
        let contents = replayable(history)
            .into_iter()
            .map(|m| GeminiContent::new(m.role, m.content.clone(), &m.files))
            .collect::<Vec<_>>();
        if contents.is_empty() {
            return Ok(0);
        }
        let parsed: CountTokensResponse = self
            .post("countTokens", &CountTokensRequest { contents })
            .await?
            .json()
            .await
            .map_err(|e| AppError::generation(format!("Invalid countTokens body: {e}")))?;
        Ok(parsed.total_tokens)
    }
}

// ── Request shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    safety_settings: Vec<GeminiSafetySetting>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<GeminiTool>,
}

impl GeminiRequest {
    fn build(request: &GenerationRequest) -> Result<Self, AppError> {
        let (prior, active) = split_active(&request.history);
        let active = active.ok_or_else(|| AppError::EmptyField { field_name: "message".to_string() })?;

        let mut contents: Vec<GeminiContent> = prior
            .into_iter()
            .map(|m| GeminiContent::new(m.role, m.content.clone(), &m.files))
            .collect();
        if contents.is_empty() {
            debug!("single-turn request");
        }
        let files = if request.files.is_empty() { &active.files } else { &request.files };
        contents.push(GeminiContent::new(
            MessageRole::User,
            with_instruction(request.system_instruction.as_deref(), &active.content),
            files,
        ));

        let params = &request.params;
        Ok(Self {
            contents,
            generation_config: GeminiGenerationConfig::from(params),
            safety_settings: GeminiSafetySetting::from_params(params),
            tools: if params.grounding_enabled {
                vec![GeminiTool { google_search: GoogleSearch {} }]
            } else {
                Vec::new()
            },
        })
    }
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

impl GeminiContent {
    fn new(role: MessageRole, text: String, files: &[FileRef]) -> Self {
        let mut parts: Vec<GeminiPart> = files
            .iter()
            .map(|f| GeminiPart::File {
                file_data: GeminiFileData { mime_type: f.mime_type.clone(), file_uri: f.uri.clone() },
            })
            .collect();
        if !text.is_empty() {
            parts.push(GeminiPart::Text { text });
        }
        let role = if role == MessageRole::Model { "model" } else { "user" };
        Self { role, parts }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    File {
        #[serde(rename = "fileData")]
        file_data: GeminiFileData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiFileData {
    mime_type: String,
    file_uri: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_output_tokens: u32,
    thinking_config: GeminiThinkingConfig,
}

impl From<&GenerationParams> for GeminiGenerationConfig {
    fn from(params: &GenerationParams) -> Self {
        let thinking_config = if params.thinking_enabled {
            GeminiThinkingConfig {
                thinking_budget: params.thinking_budget,
                include_thoughts: params.include_summaries,
            }
        } else {
            GeminiThinkingConfig { thinking_budget: 0, include_thoughts: false }
        };
        Self {
            temperature: params.temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            max_output_tokens: params.max_output_tokens,
            thinking_config,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiThinkingConfig {
    thinking_budget: i32,
    include_thoughts: bool,
}

#[derive(Debug, Serialize)]
struct GeminiSafetySetting {
    category: &'static str,
    threshold: &'static str,
}

impl GeminiSafetySetting {
    fn from_params(params: &GenerationParams) -> Vec<Self> {
        let safety = &params.safety;
        [
            ("HARM_CATEGORY_HARASSMENT", safety.harassment),
            ("HARM_CATEGORY_HATE_SPEECH", safety.hate_speech),
            ("HARM_CATEGORY_SEXUALLY_EXPLICIT", safety.sexually_explicit),
            ("HARM_CATEGORY_DANGEROUS_CONTENT", safety.dangerous_content),
        ]
        .into_iter()
        .map(|(category, threshold)| Self { category, threshold: threshold.as_str() })
        .collect()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiTool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Serialize)]
struct CountTokensRequest {
    contents: Vec<GeminiContent>,
}

// ── Response shapes ───────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
    prompt_feedback: Option<GeminiPromptFeedback>,
    error: Option<GeminiErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    finish_reason: Option<String>,
    grounding_metadata: Option<GeminiGroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiContentResponse {
    parts: Vec<GeminiPartResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiPartResponse {
    text: Option<String>,
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GeminiUsage {
    prompt_token_count: u32,
    candidates_token_count: u32,
    total_token_count: u32,
    thoughts_token_count: Option<u32>,
}

impl From<GeminiUsage> for TokenUsage {
    fn from(usage: GeminiUsage) -> Self {
        TokenUsage {
            total: usage.total_token_count,
            prompt: usage.prompt_token_count,
            completion: usage.candidates_token_count,
            thinking: usage.thoughts_token_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GeminiGroundingMetadata {
    web_search_queries: Vec<String>,
    grounding_chunks: Vec<GeminiGroundingChunk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiGroundingChunk {
    web: Option<GeminiWebSource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiWebSource {
    uri: String,
    title: Option<String>,
}

impl From<GeminiGroundingMetadata> for GroundingMetadata {
    fn from(metadata: GeminiGroundingMetadata) -> Self {
        GroundingMetadata {
            web_search_queries: metadata.web_search_queries,
            sources: metadata
                .grounding_chunks
                .into_iter()
                .filter_map(|chunk| chunk.web)
                .map(|web| GroundingSource { uri: web.uri, title: web.title })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GeminiPromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct GeminiErrorDetail {
    message: String,
    #[allow(dead_code)]
    code: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CountTokensResponse {
    total_tokens: u32,
}

/// Folds response chunks into the final result while yielding the deltas.
#[derive(Debug, Default)]
struct ResponseAccumulator {
    text: String,
    thinking: String,
    usage: Option<TokenUsage>,
    grounding: Option<GroundingMetadata>,
}

impl ResponseAccumulator {
    fn absorb(&mut self, response: GeminiResponse) -> Result<Vec<StreamChunk>, AppError> {
        if let Some(error) = response.error {
            error!("Gemini API error: {}", error.message);
            return Err(AppError::generation(format!("Gemini API error: {}", error.message)));
        }
        if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(AppError::generation(format!("Prompt blocked: {reason}")));
        }
        // Later chunks carry cumulative counts.
        if let Some(usage) = response.usage_metadata {
            self.usage = Some(usage.into());
        }

        let mut deltas = Vec::new();
        if let Some(candidate) = response.candidates.into_iter().next() {
            if let Some(reason) = candidate.finish_reason.as_deref() {
                if reason != "STOP" && reason != "MAX_TOKENS" {
                    warn!("Gemini candidate finished with {reason}");
                }
            }
            if let Some(grounding) = candidate.grounding_metadata {
                let grounding = GroundingMetadata::from(grounding);
                if !grounding.is_empty() {
                    self.grounding = Some(grounding);
                }
            }
            let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
            for part in parts {
                let Some(text) = part.text.filter(|t| !t.is_empty()) else {
                    continue;
                };
                if part.thought {
                    self.thinking.push_str(&text);
                    deltas.push(StreamChunk::Thinking(text));
                } else {
                    self.text.push_str(&text);
                    deltas.push(StreamChunk::Answer(text));
                }
            }
        }
        Ok(deltas)
    }

    fn finish(self) -> GenerationResult {
        GenerationResult {
            text: self.text,
            thinking: (!self.thinking.is_empty()).then_some(self.thinking),
            // A zero total means the service never reported real counts.
            usage: self.usage.filter(|u| u.total > 0),
            grounding: self.grounding,
        }
    }
}
