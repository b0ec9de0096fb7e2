use thiserror::Error;

/// Top-level application error.
/// All variants carry a human-readable message for display/logging.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Storage errors ───────────────────────────────────────────────────────
    #[error("Database query failed: {message}")]
    DatabaseQueryFailed {
        message: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Record not found: {entity_type} with id '{id}'")]
    RecordNotFound { entity_type: String, id: String },

    // ── Generation errors ────────────────────────────────────────────────────
    #[error("Generation service unavailable at {host}")]
    GenerationUnavailable { host: String },

    #[error("Generation failed: {message}")]
    GenerationFailed { message: String },

    #[error("Generation cancelled")]
    Cancelled,

    // ── Precondition errors ──────────────────────────────────────────────────
    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Missing credentials for {backend}")]
    MissingCredentials { backend: String },

    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Conversation errors ──────────────────────────────────────────────────
    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn db_query(message: impl Into<String>, source: sqlx::Error) -> Self {
        AppError::DatabaseQueryFailed { message: message.into(), source }
    }

    pub fn generation(message: impl Into<String>) -> Self {
        AppError::GenerationFailed { message: message.into() }
    }

    pub fn message_not_found(id: &str) -> Self {
        AppError::RecordNotFound { entity_type: "message".to_string(), id: id.to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::ConversationNotFound { .. } | AppError::RecordNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, AppError::EmptyField { .. } | AppError::FieldTooLong { .. })
    }

    /// Rejected before any state was touched.
    pub fn is_precondition(&self) -> bool {
        self.is_validation()
            || matches!(
                self,
                AppError::NoActiveConversation
                    | AppError::MissingCredentials { .. }
                    | AppError::ConversationNotFound { .. }
            )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    pub fn is_agent_unavailable(&self) -> bool {
        matches!(self, AppError::GenerationUnavailable { .. })
    }
}
