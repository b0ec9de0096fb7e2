use sqlx::{PgPool, Row};
use tracing::error;

use crate::errors::AppError;
use crate::models::{FileRef, GroundingMetadata, Message, MessageRole};

#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String, AppError> {
    serde_json::to_string(value).map_err(|e| AppError::Unexpected(format!("JSON encode failed: {e}")))
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, AppError> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, turn_id, role, content, files, grounding, created_at
             FROM messages
             WHERE conversation_id = $1
             ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fetch messages for conversation {conversation_id}: {e}");
            AppError::db_query(
                format!("Failed to fetch messages for conversation {conversation_id}"),
                e,
            )
        })?;

        rows.into_iter()
            .map(|row: sqlx::postgres::PgRow| {
                let role_str: String = row.try_get("role")
                    .map_err(|e| AppError::db_query("Failed to read role", e))?;
                let role = MessageRole::try_from(role_str)
                    .map_err(|e| AppError::Unexpected(format!("Unknown message role: {e}")))?;
                let files: String = row.try_get("files")
                    .map_err(|e| AppError::db_query("Failed to read files", e))?;
                let files: Vec<FileRef> = serde_json::from_str(&files)
                    .map_err(|e| AppError::Unexpected(format!("Corrupt file references: {e}")))?;
                let grounding: Option<String> = row.try_get("grounding")
                    .map_err(|e| AppError::db_query("Failed to read grounding", e))?;
                let grounding = grounding
                    .map(|g| serde_json::from_str::<GroundingMetadata>(&g))
                    .transpose()
                    .map_err(|e| AppError::Unexpected(format!("Corrupt grounding metadata: {e}")))?;
                Ok(Message {
                    id: row.try_get("id")
                        .map_err(|e| AppError::db_query("Failed to read id", e))?,
                    conversation_id: row.try_get("conversation_id")
                        .map_err(|e| AppError::db_query("Failed to read conversation_id", e))?,
                    turn_id: row.try_get("turn_id")
                        .map_err(|e| AppError::db_query("Failed to read turn_id", e))?,
                    role,
                    content: row.try_get("content")
                        .map_err(|e| AppError::db_query("Failed to read content", e))?,
                    created_at: row.try_get("created_at")
                        .map_err(|e| AppError::db_query("Failed to read created_at", e))?,
                    files,
                    grounding,
                })
            })
            .collect()
    }

    pub async fn save(&self, message: &Message) -> Result<Message, AppError> {
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, turn_id, role, content, files, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(&message.turn_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(encode_json(&message.files)?)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save message {}: {e}", message.id);
            AppError::db_query("Failed to save message", e)
        })?;
        Ok(message.clone())
    }

    pub async fn update_content(
        &self,
        conversation_id: &str,
        message_id: &str,
        delta: &str,
        append: bool,
    ) -> Result<(), AppError> {
        let sql = if append {
            "UPDATE messages SET content = content || $1 WHERE id = $2 AND conversation_id = $3"
        } else {
            "UPDATE messages SET content = $1 WHERE id = $2 AND conversation_id = $3"
        };
        let result = sqlx::query(sql)
            .bind(delta)
            .bind(message_id)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to update message {message_id}: {e}");
                AppError::db_query("Failed to update message", e)
            })?;
        if result.rows_affected() == 0 {
            return Err(AppError::message_not_found(message_id));
        }
        Ok(())
    }

    pub async fn update_grounding(
        &self,
        conversation_id: &str,
        message_id: &str,
        grounding: &GroundingMetadata,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE messages SET grounding = $1 WHERE id = $2 AND conversation_id = $3",
        )
        .bind(encode_json(grounding)?)
        .bind(message_id)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to patch grounding on message {message_id}: {e}");
            AppError::db_query("Failed to update grounding", e)
        })?;
        if result.rows_affected() == 0 {
            return Err(AppError::message_not_found(message_id));
        }
        Ok(())
    }
}
