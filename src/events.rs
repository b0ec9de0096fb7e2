use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{MessageRole, TokenUsage};
use crate::service::turns::TurnPhase;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// State changes pushed to UI subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    MessageAdded {
        conversation_id: String,
        message_id: String,
        turn_id: String,
        role: MessageRole,
        content: String,
    },
    MessageDelta {
        conversation_id: String,
        message_id: String,
        delta: String,
    },
    PhaseChanged {
        conversation_id: String,
        turn_id: String,
        phase: TurnPhase,
    },
    UsageUpdated {
        conversation_id: String,
        usage: TokenUsage,
    },
    TitleUpdated {
        conversation_id: String,
        title: String,
    },
    TurnFinished {
        conversation_id: String,
        turn_id: String,
        status: &'static str,
        error: Option<String>,
    },
}

impl ConversationEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ConversationEvent::MessageAdded { conversation_id, .. }
            | ConversationEvent::MessageDelta { conversation_id, .. }
            | ConversationEvent::PhaseChanged { conversation_id, .. }
            | ConversationEvent::UsageUpdated { conversation_id, .. }
            | ConversationEvent::TitleUpdated { conversation_id, .. }
            | ConversationEvent::TurnFinished { conversation_id, .. } => conversation_id,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConversationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Having no subscribers is not an error.
    pub fn publish(&self, event: ConversationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.tx.subscribe()
    }
}
