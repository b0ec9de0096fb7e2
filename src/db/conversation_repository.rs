use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{Conversation, TokenUsage};

const CONVERSATION_COLUMNS: &str = "id, title, model, total_tokens, prompt_tokens, \
     completion_tokens, thinking_tokens, title_generation_in_flight, created_at, updated_at";

#[derive(Clone)]
pub struct ConversationRepository {
    pool: PgPool,
}

fn read_conversation(row: PgRow) -> Result<Conversation, AppError> {
    let read = |column: &str, e: sqlx::Error| AppError::db_query(format!("Failed to read {column}"), e);

    let total: Option<i32> = row.try_get("total_tokens").map_err(|e| read("total_tokens", e))?;
    let token_usage = match total {
        Some(total) => Some(TokenUsage {
            total: total as u32,
            prompt: row
                .try_get::<Option<i32>, _>("prompt_tokens")
                .map_err(|e| read("prompt_tokens", e))?
                .unwrap_or_default() as u32,
            completion: row
                .try_get::<Option<i32>, _>("completion_tokens")
                .map_err(|e| read("completion_tokens", e))?
                .unwrap_or_default() as u32,
            thinking: row
                .try_get::<Option<i32>, _>("thinking_tokens")
                .map_err(|e| read("thinking_tokens", e))?
                .map(|t| t as u32),
        }),
        None => None,
    };

    Ok(Conversation {
        id: row.try_get("id").map_err(|e| read("id", e))?,
        title: row.try_get("title").map_err(|e| read("title", e))?,
        model: row.try_get("model").map_err(|e| read("model", e))?,
        messages: Vec::new(),
        token_usage,
        title_generation_in_flight: row
            .try_get("title_generation_in_flight")
            .map_err(|e| read("title_generation_in_flight", e))?,
        created_at: row.try_get("created_at").map_err(|e| read("created_at", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| read("updated_at", e))?,
    })
}

impl ConversationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_all(&self) -> Result<Vec<Conversation>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations ORDER BY updated_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch all conversations: {e}");
            AppError::db_query("Failed to fetch conversations", e)
        })?;
        rows.into_iter().map(read_conversation).collect()
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Conversation>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to find conversation {id}: {e}");
            AppError::db_query(format!("Failed to find conversation {id}"), e)
        })?;
        row.map(read_conversation).transpose()
    }

    pub async fn save(&self, conversation: &Conversation) -> Result<Conversation, AppError> {
        sqlx::query(
            "INSERT INTO conversations (id, title, model, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&conversation.id)
        .bind(&conversation.title)
        .bind(&conversation.model)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save conversation {}: {e}", conversation.id);
            AppError::db_query("Failed to save conversation", e)
        })?;
        Ok(conversation.clone())
    }

    pub async fn update_timestamp(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE conversations SET updated_at = $1 WHERE id = $2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update conversation timestamp {id}: {e}");
                AppError::db_query("Failed to update conversation", e)
            })?;
        Ok(())
    }

    pub async fn update_title(&self, id: &str, title: &str) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE conversations SET title = $1, updated_at = $2 WHERE id = $3")
            .bind(title)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update conversation title {id}: {e}");
                AppError::db_query("Failed to update conversation title", e)
            })?;
        if result.rows_affected() == 0 {
            return Err(AppError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub async fn update_token_usage(&self, id: &str, usage: TokenUsage) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE conversations
             SET total_tokens = $1, prompt_tokens = $2, completion_tokens = $3, thinking_tokens = $4
             WHERE id = $5",
        )
        .bind(usage.total as i32)
        .bind(usage.prompt as i32)
        .bind(usage.completion as i32)
        .bind(usage.thinking.map(|t| t as i32))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to update token usage for {id}: {e}");
            AppError::db_query("Failed to update token usage", e)
        })?;
        if result.rows_affected() == 0 {
            return Err(AppError::ConversationNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Compare-and-set on `title_generation_in_flight`.
    pub async fn set_title_generation_flag(
        &self,
        id: &str,
        in_flight: bool,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE conversations SET title_generation_in_flight = $1
             WHERE id = $2 AND title_generation_in_flight = $3",
        )
        .bind(in_flight)
        .bind(id)
        .bind(!in_flight)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to flip title generation flag for {id}: {e}");
            AppError::db_query("Failed to update title generation flag", e)
        })?;
        Ok(result.rows_affected() == 1)
    }
}
