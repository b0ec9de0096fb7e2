use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::ConversationStore;
use crate::errors::AppError;
use crate::models::{Conversation, GroundingMetadata, Message, NewMessage, TokenUsage};

/// In-memory store for development and testing.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Conversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_conversation<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Conversation) -> Result<T, AppError>,
    ) -> Result<T, AppError> {
        let mut conversations = self
            .conversations
            .write()
            .map_err(|e| AppError::Unexpected(e.to_string()))?;
        let conversation = conversations
            .get_mut(id)
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })?;
        f(conversation)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_conversation(
        &self,
        model: &str,
        title: Option<String>,
    ) -> Result<Conversation, AppError> {
        let conversation = Conversation::new(Uuid::new_v4().to_string(), model.to_string(), title);
        self.conversations
            .write()
            .map_err(|e| AppError::Unexpected(e.to_string()))?
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        let conversations = self
            .conversations
            .read()
            .map_err(|e| AppError::Unexpected(e.to_string()))?;
        let mut list: Vec<Conversation> = conversations
            .values()
            .map(|c| Conversation { messages: Vec::new(), ..c.clone() })
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        Ok(self
            .conversations
            .read()
            .map_err(|e| AppError::Unexpected(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.with_conversation(conversation_id, |c| Ok(c.messages.clone()))
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<String, AppError> {
        self.with_conversation(conversation_id, |c| {
            let message = Message::new(c.id.clone(), message);
            let id = message.id.clone();
            c.messages.push(message);
            c.updated_at = Utc::now();
            Ok(id)
        })
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
        append: bool,
        grounding: Option<GroundingMetadata>,
    ) -> Result<(), AppError> {
        self.with_conversation(conversation_id, |c| {
            let message = c
                .messages
                .iter_mut()
                .find(|m| m.id == message_id)
                .ok_or_else(|| AppError::message_not_found(message_id))?;
            if append {
                message.content.push_str(delta);
            } else {
                message.content = delta.to_string();
            }
            if grounding.is_some() {
                message.grounding = grounding;
            }
            Ok(())
        })
    }

    async fn set_token_count(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<(), AppError> {
        self.with_conversation(conversation_id, |c| {
            c.token_usage = Some(usage);
            Ok(())
        })
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), AppError> {
        self.with_conversation(conversation_id, |c| {
            c.title = Some(title.to_string());
            c.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn try_begin_title_generation(&self, conversation_id: &str) -> Result<bool, AppError> {
        self.with_conversation(conversation_id, |c| {
            if c.title_generation_in_flight {
                return Ok(false);
            }
            c.title_generation_in_flight = true;
            Ok(true)
        })
    }

    async fn end_title_generation(&self, conversation_id: &str) -> Result<(), AppError> {
        self.with_conversation(conversation_id, |c| {
            c.title_generation_in_flight = false;
            Ok(())
        })
    }
}
