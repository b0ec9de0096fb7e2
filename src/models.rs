use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-character reveal period used when no streaming speed is configured.
pub const DEFAULT_STREAMING_SPEED_MS: u64 = 25;
pub const MIN_STREAMING_SPEED_MS: u64 = 5;
pub const MAX_STREAMING_SPEED_MS: u64 = 15;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u32,
    pub prompt: u32,
    pub completion: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<u32>,
}

impl TokenUsage {
    /// Usage known only as a single total, as returned by a counting call.
    pub fn total_only(total: u32) -> Self {
        Self { total, ..Self::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub title_generation_in_flight: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, model: String, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            model,
            messages: Vec::new(),
            token_usage: None,
            title_generation_in_flight: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Model,
    Thinking,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "USER",
            MessageRole::Model => "MODEL",
            MessageRole::Thinking => "THINKING",
            MessageRole::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for MessageRole {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "USER" => Ok(MessageRole::User),
            "MODEL" => Ok(MessageRole::Model),
            "THINKING" => Ok(MessageRole::Thinking),
            "SYSTEM" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// Reference to a file uploaded alongside a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub uri: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingSource {
    pub uri: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// Search evidence attached to a finalized model message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingMetadata {
    #[serde(default)]
    pub web_search_queries: Vec<String>,
    #[serde(default)]
    pub sources: Vec<GroundingSource>,
}

impl GroundingMetadata {
    pub fn is_empty(&self) -> bool {
        self.web_search_queries.is_empty() && self.sources.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub grounding: Option<GroundingMetadata>,
}

impl Message {
    pub fn new(conversation_id: String, new: NewMessage) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            turn_id: new.turn_id,
            role: new.role,
            content: new.content,
            created_at: Utc::now(),
            files: new.files,
            grounding: None,
        }
    }
}

/// Input to `ConversationStore::add_message`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub turn_id: String,
    pub files: Vec<FileRef>,
}

impl NewMessage {
    pub fn empty(role: MessageRole, turn_id: &str) -> Self {
        Self { role, content: String::new(), turn_id: turn_id.to_string(), files: Vec::new() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyThreshold {
    BlockNone,
    BlockOnlyHigh,
    #[default]
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

impl SafetyThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyThreshold::BlockNone => "BLOCK_NONE",
            SafetyThreshold::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            SafetyThreshold::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            SafetyThreshold::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
        }
    }
}

impl std::str::FromStr for SafetyThreshold {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BLOCK_NONE" => Ok(SafetyThreshold::BlockNone),
            "BLOCK_ONLY_HIGH" => Ok(SafetyThreshold::BlockOnlyHigh),
            "BLOCK_MEDIUM_AND_ABOVE" => Ok(SafetyThreshold::BlockMediumAndAbove),
            "BLOCK_LOW_AND_ABOVE" => Ok(SafetyThreshold::BlockLowAndAbove),
            other => Err(format!("Unknown safety threshold: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyThresholds {
    #[serde(default)]
    pub harassment: SafetyThreshold,
    #[serde(default)]
    pub hate_speech: SafetyThreshold,
    #[serde(default)]
    pub sexually_explicit: SafetyThreshold,
    #[serde(default)]
    pub dangerous_content: SafetyThreshold,
}

impl SafetyThresholds {
    pub fn uniform(threshold: SafetyThreshold) -> Self {
        Self {
            harassment: threshold,
            hate_speech: threshold,
            sexually_explicit: threshold,
            dangerous_content: threshold,
        }
    }
}

/// Per-turn generation parameters. Out-of-range values are clamped by
/// [`GenerationParams::normalized`] rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
    pub thinking_enabled: bool,
    /// `-1` lets the service pick the budget dynamically.
    pub thinking_budget: i32,
    pub include_summaries: bool,
    /// Milliseconds per revealed character; `None` uses the default pace.
    pub streaming_speed_ms: Option<u64>,
    pub grounding_enabled: bool,
    pub safety: SafetyThresholds,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 40,
            max_output_tokens: 8192,
            thinking_enabled: false,
            thinking_budget: -1,
            include_summaries: true,
            streaming_speed_ms: None,
            grounding_enabled: false,
            safety: SafetyThresholds::default(),
        }
    }
}

impl GenerationParams {
    pub fn normalized(mut self) -> Self {
        self.temperature = self.temperature.clamp(0.0, 1.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        self.thinking_budget = self.thinking_budget.max(-1);
        self.streaming_speed_ms = self
            .streaming_speed_ms
            .map(|ms| ms.clamp(MIN_STREAMING_SPEED_MS, MAX_STREAMING_SPEED_MS));
        self
    }

    pub fn tick_period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(
            self.streaming_speed_ms.unwrap_or(DEFAULT_STREAMING_SPEED_MS),
        )
    }
}

/// The model is fixed by the configured backend, so only a title is taken.
#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub files: Vec<FileRef>,
    #[serde(default)]
    pub params: Option<GenerationParams>,
}

/// Result of a send as reported to the caller. `error` stays `None` for
/// aborted turns.
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub turn_id: Option<String>,
    pub status: &'static str,
    pub error: Option<String>,
}
