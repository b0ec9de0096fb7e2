pub mod conversation_repository;
pub mod memory;
pub mod message_repository;
pub mod postgres;

use async_trait::async_trait;

use crate::errors::AppError;
use crate::models::{Conversation, GroundingMetadata, Message, NewMessage, TokenUsage};

pub use memory::InMemoryConversationStore;
pub use postgres::PgConversationStore;

/// Owner of conversation state. The orchestrator only mutates conversations
/// through this interface; message content is written through
/// [`ConversationStore::update_message`] alone.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        model: &str,
        title: Option<String>,
    ) -> Result<Conversation, AppError>;

    /// Newest first. Messages are not loaded.
    async fn list_conversations(&self) -> Result<Vec<Conversation>, AppError>;

    /// Conversation with its messages in creation order.
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, AppError>;

    async fn messages(&self, conversation_id: &str) -> Result<Vec<Message>, AppError>;

    /// Returns the id of the new message.
    async fn add_message(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<String, AppError>;

    /// Appends `delta` to the message content, or replaces it when `append`
    /// is false. `grounding`, when present, replaces the grounding metadata.
    async fn update_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
        append: bool,
        grounding: Option<GroundingMetadata>,
    ) -> Result<(), AppError>;

    async fn set_token_count(
        &self,
        conversation_id: &str,
        usage: TokenUsage,
    ) -> Result<(), AppError>;

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), AppError>;

    /// Sets `title_generation_in_flight`; returns false when it was already set.
    async fn try_begin_title_generation(&self, conversation_id: &str) -> Result<bool, AppError>;

    async fn end_title_generation(&self, conversation_id: &str) -> Result<(), AppError>;
}
