use async_trait::async_trait;
use sqlx::PgPool;
use tracing::error;
use uuid::Uuid;

use super::conversation_repository::ConversationRepository;
use super::message_repository::MessageRepository;
use super::ConversationStore;
use crate::errors::AppError;
use crate::models::{Conversation, GroundingMetadata, Message, NewMessage, TokenUsage};

/// PostgreSQL-backed store composed of the conversation and message repositories.
#[derive(Clone)]
pub struct PgConversationStore {
    conversations: ConversationRepository,
    messages: MessageRepository,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            conversations: ConversationRepository::new(pool.clone()),
            messages: MessageRepository::new(pool),
        }
    }

    async fn require(&self, id: &str) -> Result<Conversation, AppError> {
        self.conversations
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::ConversationNotFound { id: id.to_string() })
    }
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn create_conversation(
        &self,
        model: &str,
        title: Option<String>,
    ) -> Result<Conversation, AppError> {
        let conversation = Conversation::new(Uuid::new_v4().to_string(), model.to_string(), title);
        self.conversations.save(&conversation).await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError> {
        self.conversations.find_all().await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let Some(mut conversation) = self.conversations.find_by_id(id).await? else {
            return Ok(None);
        };
        conversation.messages = self.messages.find_by_conversation_id(id).await?;
        Ok(Some(conversation))
    }

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError> {
        self.require(conversation_id).await?;
        self.messages.find_by_conversation_id(conversation_id).await
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<String, AppError> {
        self.require(conversation_id).await?;
        let message = Message::new(conversation_id.to_string(), message);
        self.messages.save(&message).await?;
        if let Err(e) = self.conversations.update_timestamp(conversation_id).await {
            error!("Failed to update conversation timestamp: {e}");
        }
        Ok(message.id)
    }

    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
        append: bool,
        grounding: Option<GroundingMetadata>,
    ) -> Result<(), AppError> {
        if !(append && delta.is_empty()) {
            self.messages
                .update_content(conversation_id, message_id, delta, append)
                .await?;
        }
        if let Some(grounding) = grounding {
            self.messages
                .update_grounding(conversation_id, message_id, &grounding)
                .await?;
        }
        Ok(())
    }

    async fn set_token_count(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<(), AppError> {
        self.conversations.update_token_usage(conversation_id, usage).await
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), AppError> {
        self.conversations.update_title(conversation_id, title).await
    }

    async fn try_begin_title_generation(&self, conversation_id: &str) -> Result<bool, AppError> {
        self.require(conversation_id).await?;
        self.conversations
            .set_title_generation_flag(conversation_id, true)
            .await
    }

    async fn end_title_generation(&self, conversation_id: &str) -> Result<(), AppError> {
        self.conversations
            .set_title_generation_flag(conversation_id, false)
            .await
            .map(|_| ())
    }
}
