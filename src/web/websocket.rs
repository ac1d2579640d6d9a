//! WebSocket handler for JSON-RPC communication.
//!
//! One text frame carries one request; framing otherwise matches the TCP
//! transport.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use super::WebState;
use crate::rpc::{Response, process_message};

/// Handle WebSocket upgrade requests
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle an established WebSocket connection
async fn handle_socket(mut socket: WebSocket, state: WebState) {
    while let Some(msg) = socket.recv().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // Ignore binary, ping, pong
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive error");
                break;
            }
        };

        let Some(response) = process_message(&state.handler, text.as_str()).await else {
            continue;
        };

        let payload = serde_json::to_string(&response).unwrap_or_else(|e| {
            let fallback = Response::internal_error(response.id.clone(), e.to_string());
            serde_json::to_string(&fallback).unwrap_or_default()
        });

        if socket.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }

    tracing::debug!("WebSocket connection closed");
}
