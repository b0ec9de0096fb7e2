//! Conversation titles, generated once a conversation has some substance and
//! refreshed as it grows.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{GenerationClient, GenerationRequest};
use crate::db::ConversationStore;
use crate::errors::AppError;
use crate::events::{ConversationEvent, EventBus};
use crate::models::{Conversation, GenerationParams, Message, MessageRole, NewMessage};

pub const FIRST_TITLE_AT: usize = 3;
pub const TITLE_REFRESH_EVERY: usize = 10;
const MAX_TITLE_CHARS: usize = 60;
const TRANSCRIPT_MESSAGES: usize = 10;
const TITLE_INSTRUCTION: &str = "Write a short title (at most six words) for the conversation \
                                 below. Reply with the title only, without quotes.";

/// `before` and `after` count non-thinking messages around the latest turn.
pub fn should_generate(before: usize, after: usize, has_title: bool) -> bool {
    if has_title {
        after / TITLE_REFRESH_EVERY > before / TITLE_REFRESH_EVERY
    } else {
        after >= FIRST_TITLE_AT
    }
}

/// First line of the model reply, stripped of decoration and capped in length.
pub fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let t = line
        .trim_start_matches(|c: char| c == '#' || c == '*' || c.is_whitespace())
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c: char| matches!(c, '"' | '\'' | '*' | '`'))
        .trim();
    if t.is_empty() {
        return None;
    }
    Some(if t.chars().count() > MAX_TITLE_CHARS {
        format!("{}…", t.chars().take(MAX_TITLE_CHARS).collect::<String>())
    } else {
        t.to_string()
    })
}

fn transcript(messages: &[Message]) -> String {
    let relevant: Vec<&Message> = messages
        .iter()
        .filter(|m| matches!(m.role, MessageRole::User | MessageRole::Model))
        .filter(|m| !m.content.is_empty())
        .collect();
    let start = relevant.len().saturating_sub(TRANSCRIPT_MESSAGES);
    relevant[start..]
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct TitleService {
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn GenerationClient>,
    events: EventBus,
}

impl TitleService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn GenerationClient>,
        events: EventBus,
    ) -> Self {
        Self { store, client, events }
    }

    /// Fire-and-forget variant of [`TitleService::maybe_generate`].
    pub fn spawn(self: &Arc<Self>, conversation_id: String, messages_added: usize) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.maybe_generate(&conversation_id, messages_added).await;
        })
    }

    /// Returns the new title when one was generated. Failures are logged and
    /// swallowed; the in-flight flag is always cleared once set.
    pub async fn maybe_generate(&self, conversation_id: &str, messages_added: usize) -> Option<String> {
        let conversation = match self.store.get_conversation(conversation_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                warn!("Title check failed for conversation {conversation_id}: {e}");
                return None;
            }
        };

        let after = conversation
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::Thinking)
            .count();
        let before = after.saturating_sub(messages_added);
        if !should_generate(before, after, conversation.title.is_some()) {
            return None;
        }

        match self.store.try_begin_title_generation(conversation_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(conversation_id, "title generation already in flight");
                return None;
            }
            Err(e) => {
                warn!("Could not claim title generation for {conversation_id}: {e}");
                return None;
            }
        }

        let outcome = self.generate(&conversation).await;

        if let Err(e) = self.store.end_title_generation(conversation_id).await {
            error!("Failed to clear title generation flag for {conversation_id}: {e}");
        }

        match outcome {
            Ok(title) => {
                info!(conversation_id, %title, "conversation titled");
                Some(title)
            }
            Err(e) => {
                warn!("Title generation failed for conversation {conversation_id}: {e}");
                None
            }
        }
    }

    async fn generate(&self, conversation: &Conversation) -> Result<String, AppError> {
        let prompt = Message::new(
            conversation.id.clone(),
            NewMessage {
                role: MessageRole::User,
                content: transcript(&conversation.messages),
                turn_id: String::new(),
                files: Vec::new(),
            },
        );
        let request = GenerationRequest {
            history: vec![prompt],
            system_instruction: Some(TITLE_INSTRUCTION.to_string()),
            params: GenerationParams {
                temperature: 0.2,
                max_output_tokens: 64,
                ..GenerationParams::default()
            },
            files: Vec::new(),
        };

        let result = self
            .client
            .generate(request, None, CancellationToken::new())
            .await?;
        let title = clean_title(&result.text)
            .ok_or_else(|| AppError::generation("title generation returned no text"))?;

        self.store.set_title(&conversation.id, &title).await?;
        self.events.publish(ConversationEvent::TitleUpdated {
            conversation_id: conversation.id.clone(),
            title: title.clone(),
        });
        Ok(title)
    }
}
