use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::AppError;
use crate::models::{ChatRequest, ChatResponse, CreateConversationRequest};
use crate::service::{ChatService, TurnOutcome};

// ── Handlers ─────────────────────────────────────────────────────────────────

/// POST `/api/conversations`
pub async fn create_conversation_handler(
    State(svc): State<ChatService>,
    body: Bytes,
) -> Response {
    // An empty body creates an untitled conversation.
    let title = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<CreateConversationRequest>(&body) {
            Ok(req) => req.title,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "error": format!("Invalid request: {e}") })))
                    .into_response()
            }
        }
    };
    match svc.create_conversation(title).await {
        Ok(conversation) => (StatusCode::CREATED, Json(conversation)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations`
pub async fn list_conversations_handler(State(svc): State<ChatService>) -> Response {
    match svc.get_conversations().await {
        Ok(convs) => Json(convs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// GET `/api/conversations/{id}/messages`
pub async fn list_messages_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> Response {
    match svc.get_messages(&id).await {
        Ok(msgs) => Json(msgs).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/messages`. Resolves when the turn is over;
/// live progress goes out over the conversation's WebSocket.
pub async fn send_message_handler(
    Path(id): Path<String>,
    State(svc): State<ChatService>,
    Json(request): Json<ChatRequest>,
) -> Response {
    match svc.send(Some(&id), request).await {
        // Busy is reported in the body, not as an HTTP error.
        Ok(outcome) => Json(chat_response(&id, &outcome)).into_response(),
        Err(e) => error_response(&e),
    }
}

/// POST `/api/conversations/{id}/abort`. Aborting an idle conversation is a
/// no-op.
pub async fn abort_handler(Path(id): Path<String>, State(svc): State<ChatService>) -> Response {
    let aborted = svc.abort(&id);
    Json(json!({ "conversation_id": id, "aborted": aborted })).into_response()
}

// ── Helpers ──────────────────────────────────────────────────────────────────

pub fn chat_response(conversation_id: &str, outcome: &TurnOutcome) -> ChatResponse {
    ChatResponse {
        conversation_id: conversation_id.to_string(),
        turn_id: outcome.turn_id().map(str::to_string),
        status: outcome.status(),
        error: outcome.error().map(str::to_string),
    }
}

pub fn status_for(err: &AppError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if matches!(err, AppError::MissingCredentials { .. }) {
        StatusCode::UNAUTHORIZED
    } else if err.is_precondition() {
        StatusCode::BAD_REQUEST
    } else if err.is_agent_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn error_response(err: &AppError) -> Response {
    (status_for(err), Json(json!({ "error": err.to_string() }))).into_response()
}
