use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use super::api_routes::chat_response;
use crate::models::ChatRequest;
use crate::service::ChatService;

/// Commands accepted from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsCommand {
    Send(ChatRequest),
    Abort,
}

/// GET `/ws/conversations/{id}`: upgrades to a WebSocket bound to one
/// conversation.
pub async fn ws_conversation_handler(
    ws: WebSocketUpgrade,
    Path(id): Path<String>,
    State(svc): State<ChatService>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, svc, id))
}

/// Protocol:
/// - Server pushes every `ConversationEvent` of the conversation as JSON.
/// - Client sends `{ "type": "send", "message": "...", ... }` or
///   `{ "type": "abort" }`.
/// - A finished send is answered with `{ "type": "send_result", ... }`, a
///   rejected one with `{ "type": "error", "message": "..." }`.
async fn handle_socket(socket: WebSocket, svc: ChatService, conversation_id: String) {
    info!(conversation_id = %conversation_id, "WebSocket client connected");

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(64);
    let mut events = svc.subscribe();

    let forward_id = conversation_id.clone();
    let forward = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                event = events.recv() => match event {
                    Ok(event) if event.conversation_id() == forward_id => {
                        match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize event: {e}");
                                continue;
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(conversation_id = %forward_id, skipped, "WebSocket subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(json) => json,
                    None => break,
                },
            };
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket receive error: {e}");
                break;
            }
        };

        let command: WsCommand = match serde_json::from_str(&text) {
            Ok(c) => c,
            Err(e) => {
                let _ = reply_tx
                    .send(json!({ "type": "error", "message": format!("Invalid request: {e}") }).to_string())
                    .await;
                continue;
            }
        };

        match command {
            WsCommand::Abort => {
                svc.abort(&conversation_id);
            }
            // Runs detached so an abort on this socket is read while the turn streams.
            WsCommand::Send(request) => {
                let svc = svc.clone();
                let reply_tx = reply_tx.clone();
                let conversation_id = conversation_id.clone();
                tokio::spawn(async move {
                    let reply = match svc.send(Some(&conversation_id), request).await {
                        Ok(outcome) => {
                            let mut body = json!(chat_response(&conversation_id, &outcome));
                            body["type"] = json!("send_result");
                            body
                        }
                        Err(e) => json!({ "type": "error", "message": e.to_string() }),
                    };
                    let _ = reply_tx.send(reply.to_string()).await;
                });
            }
        }
    }

    drop(reply_tx);
    forward.abort();
    info!(conversation_id = %conversation_id, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_client_commands() {
        let send: WsCommand =
            serde_json::from_str(r#"{"type":"send","message":"hello","params":{"thinking_enabled":true}}"#)
                .unwrap();
        match send {
            WsCommand::Send(request) => {
                assert_eq!(request.message, "hello");
                assert!(request.params.unwrap().thinking_enabled);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(matches!(serde_json::from_str(r#"{"type":"abort"}"#).unwrap(), WsCommand::Abort));
        assert!(serde_json::from_str::<WsCommand>(r#"{"type":"shout"}"#).is_err());
    }
}
