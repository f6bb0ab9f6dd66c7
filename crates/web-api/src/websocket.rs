use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use tokio::sync::broadcast::error::RecvError;

/// Streams per-owner `PositionUpdate` messages to a connected viewer.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(owner): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(|socket| websocket_connection(socket, owner, state))
}

async fn websocket_connection(mut socket: WebSocket, owner: String, state: AppState) {
    let mut updates = state.updates.subscribe();

    loop {
        tokio::select! {
            update = updates.recv() => {
                match update {
                    Ok(update) if update.owner == owner => {
                        let json = serde_json::to_string(&update).unwrap_or_default();
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {} // someone else's position
                    Err(RecvError::Lagged(skipped)) => {
                        // At-most-once feed; viewers refetch via REST.
                        tracing::debug!("viewer for {} lagged, skipped {}", owner, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    tracing::info!("WebSocket connection closed for {}", owner);
}
