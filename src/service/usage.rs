use std::sync::Arc;

use tracing::{error, info, warn};

use crate::agent::{GenerationClient, GenerationResult};
use crate::db::ConversationStore;
use crate::events::{ConversationEvent, EventBus};
use crate::models::{Message, TokenUsage};

/// Records token accounting for a completed turn. Never fails the turn.
#[derive(Clone)]
pub struct UsageReconciler {
    store: Arc<dyn ConversationStore>,
    client: Arc<dyn GenerationClient>,
    events: EventBus,
}

impl UsageReconciler {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        client: Arc<dyn GenerationClient>,
        events: EventBus,
    ) -> Self {
        Self { store, client, events }
    }

    /// `history` is the conversation as sent plus the finished answer; it is
    /// only used when the result carries no usage and a count is needed.
    pub async fn reconcile(
        &self,
        conversation_id: &str,
        result: &GenerationResult,
        history: &[Message],
    ) -> Option<TokenUsage> {
        let usage = match result.usage {
            Some(usage) => usage,
            None => match self.client.count_tokens(history).await {
                Ok(total) => {
                    info!(conversation_id, total, "usage metadata absent, counted tokens");
                    TokenUsage::total_only(total)
                }
                Err(e) => {
                    warn!("Token counting fallback failed for conversation {conversation_id}: {e}");
                    return None;
                }
            },
        };

        if let Err(e) = self.store.set_token_count(conversation_id, usage).await {
            error!("Failed to record token usage for conversation {conversation_id}: {e}");
            return None;
        }
        self.events.publish(ConversationEvent::UsageUpdated {
            conversation_id: conversation_id.to_string(),
            usage,
        });
        Some(usage)
    }
}
