pub mod api_routes;
pub mod ws_routes;

use axum::routing::{get, post};
use axum::Router;

use crate::service::ChatService;

pub fn router(chat_service: ChatService) -> Router {
    Router::new()
        .route(
            "/api/conversations",
            get(api_routes::list_conversations_handler).post(api_routes::create_conversation_handler),
        )
        .route(
            "/api/conversations/{id}/messages",
            get(api_routes::list_messages_handler).post(api_routes::send_message_handler),
        )
        .route("/api/conversations/{id}/abort", post(api_routes::abort_handler))
        .route("/ws/conversations/{id}", get(ws_routes::ws_conversation_handler))
        .with_state(chat_service)
}
