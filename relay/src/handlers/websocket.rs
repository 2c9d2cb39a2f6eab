//! WebSocket handler for real-time sync.
//!
//! The channel carries the same pull and push exchanges as HTTP, plus
//! `envelopes_available` notices whenever another replica pushes.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use concord_engine::{ClientMessage, PullRequest, PushRequest, ServerMessage, PROTOCOL_VERSION};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use super::{handle_pull, handle_push};
use crate::AppState;

/// Handle an established WebSocket connection for an authenticated replica.
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, replica_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let conn_manager = Arc::clone(&state.conn_manager);
    let conn_id = conn_manager.register(replica_id.clone(), tx);

    tracing::info!(
        conn_id = %conn_id,
        replica_id = %replica_id,
        "WebSocket client connected"
    );

    conn_manager.send_to(
        &conn_id,
        ServerMessage::Connected {
            session_id: conn_id.clone(),
            relay_id: state.config.relay_id.clone(),
            protocol_version: PROTOCOL_VERSION,
        },
    );

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &state, &replica_id).await;
                conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                conn_manager.send_to(
                    &conn_id,
                    ServerMessage::error("Binary messages are not supported", None),
                );
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        replica_id = %replica_id,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return the reply.
pub async fn process_message(text: &str, state: &AppState, replica_id: &str) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Pull {
            cursor,
            limit,
            request_id,
        } => match handle_pull(state, replica_id, PullRequest { cursor, limit }).await {
            Ok(response) => ServerMessage::pull_response(response, request_id),
            Err(e) => ServerMessage::error(e.to_string(), request_id),
        },

        ClientMessage::Push {
            envelopes,
            request_id,
        } => match handle_push(state, replica_id, PushRequest { envelopes }).await {
            Ok(response) => ServerMessage::push_response(response, request_id),
            Err(e) => ServerMessage::error(e.to_string(), request_id),
        },

        ClientMessage::Ping => ServerMessage::Pong,
    }
}
