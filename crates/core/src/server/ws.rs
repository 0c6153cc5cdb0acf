use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::notify::{NotificationEvent, NotificationHub};

pub(super) async fn notifications_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let hub = Arc::clone(state.notifications());
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<NotificationHub>) {
    let session_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.register(&session_id, tx.clone());
    info!(session_id = %session_id, sessions = hub.session_count(), "Client connected");

    let hello = NotificationEvent::Session {
        session_id: session_id.clone(),
    };
    if send_event(&mut socket, &hello).await {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if !send_event(&mut socket, &event).await {
                        break;
                    }
                }
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(error)) => {
                            debug!(session_id = %session_id, error = %error, "WebSocket receive error");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    hub.unregister(&session_id, &tx);
    info!(session_id = %session_id, sessions = hub.session_count(), "Client disconnected");
}

/// Returns false once the socket can no longer be written.
async fn send_event(socket: &mut WebSocket, event: &NotificationEvent) -> bool {
    let json = match serde_json::to_string(event) {
        Ok(json) => json,
        Err(error) => {
            warn!(error = %error, "Failed to serialize notification");
            return true;
        }
    };
    socket.send(Message::Text(json.into())).await.is_ok()
}
