//! WebSocket handler streaming queue events

use crate::download::DownloadItem;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

/// First message on every connection so clients start from a full view
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Greeting {
    Snapshot { items: Vec<DownloadItem> },
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before taking the snapshot so no change falls in between.
    let mut events = state.queue.subscribe();
    let snapshot = Greeting::Snapshot {
        items: state.queue.items(),
    };

    info!("WebSocket client connected");

    let send_task = tokio::spawn(async move {
        match serde_json::to_string(&snapshot) {
            Ok(msg) => {
                if sender.send(Message::Text(msg.into())).await.is_err() {
                    return;
                }
            }
            Err(e) => error!("Failed to encode snapshot: {}", e),
        }

        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("WebSocket client lagged, skipped {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let msg = match serde_json::to_string(&event) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("Failed to encode event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // The stream is one-way; incoming messages only matter for close.
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                debug!("Ignoring WebSocket message: {}", text.as_str());
            }
            Ok(Message::Close(_)) => {
                info!("WebSocket client disconnected");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
}
