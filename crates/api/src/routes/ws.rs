//! WebSocket delivery endpoint.
//!
//! Client -> Server (JSON):
//! ```json
//! {"type": "ping"}
//! ```
//!
//! Server -> Client (JSON):
//! ```json
//! {"type": "notification", "notification": {...}}
//! {"type": "missed_notifications", "notifications": [...]}
//! {"type": "pong"}
//! ```
//!
//! A connection is admitted only with a valid `?token=` and only while the
//! user holds fewer than the configured number of connections; the rest are
//! closed with code 4001.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use beacon_common::error::AppError;
use beacon_engine::gateway::{ClientMessage, ServerMessage};

use crate::middleware::auth::{Identity, resolve_identity};
use crate::state::AppState;

/// Close code sent when the per-user connection cap is reached.
pub const CLOSE_CONNECTION_LIMIT: u16 = 4001;

/// Close code sent when admission fails for an internal reason.
const CLOSE_INTERNAL_ERROR: u16 = 1011;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws/notifications", get(ws_handler))
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// Authenticate, then upgrade. Anonymous callers get 401 without an upgrade.
async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Identity::User(user_id) =
        resolve_identity(params.token.as_deref(), &state.config.jwt_secret)
    else {
        return AppError::Auth("Authentication required".to_string()).into_response();
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: i64) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();

    match state.presence.add_connection(user_id, &connection_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(user_id, "Connection limit exceeded, closing socket");
            close(&mut ws_sender, CLOSE_CONNECTION_LIMIT, "connection limit exceeded").await;
            return;
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "Connection admission failed");
            close(&mut ws_sender, CLOSE_INTERNAL_ERROR, "admission failed").await;
            return;
        }
    }

    let mut group_rx = state.registry.register(user_id, &connection_id);
    if let Err(e) = state.presence.mark_online(user_id).await {
        tracing::warn!(user_id, error = %e, "Failed to mark user online");
    }
    state.metrics.connection_opened();
    tracing::info!(user_id, connection_id = %connection_id, "WebSocket connected");

    match state.service.missed_for_user(user_id).await {
        Ok(missed) if !missed.is_empty() => {
            let count = missed.len();
            let frame = ServerMessage::MissedNotifications {
                notifications: missed,
            };
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_ok() {
                        tracing::debug!(user_id, count, "Sent missed notifications");
                    }
                }
                Err(e) => {
                    tracing::error!(user_id, error = %e, "Failed to encode missed notifications")
                }
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(user_id, error = %e, "Failed to load missed notifications"),
    }

    // Replies to this connection only (pong), alongside group frames.
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);

    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                Some(frame) = group_rx.recv() => frame,
                Some(frame) = reply_rx.recv() => frame,
                else => break,
            };
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let text_str: &str = &text;
                match serde_json::from_str::<ClientMessage>(text_str) {
                    Ok(ClientMessage::Ping) => {
                        if let Err(e) = state.presence.refresh(user_id).await {
                            tracing::warn!(user_id, error = %e, "Presence refresh failed");
                        }
                        let Ok(pong) = serde_json::to_string(&ServerMessage::Pong) else {
                            continue;
                        };
                        if reply_tx.send(pong).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            user_id,
                            error = %e,
                            "Ignoring unrecognized client message"
                        );
                    }
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    release_connection(&state, user_id, &connection_id).await;
    writer.abort();
}

/// Disconnect path: leave the group, drop the connection from presence and
/// clear the online flag once the user has no connections left.
pub async fn release_connection(state: &AppState, user_id: i64, connection_id: &str) {
    state.registry.unregister(user_id, connection_id);

    match state.presence.release_connection(user_id, connection_id).await {
        Ok(0) => tracing::debug!(user_id, "Last connection closed, user offline"),
        Ok(left) => tracing::debug!(user_id, left, "Connection released"),
        Err(e) => tracing::warn!(user_id, error = %e, "Failed to release connection"),
    }

    state.metrics.connection_closed();
    tracing::info!(user_id, connection_id, "WebSocket disconnected");
}

async fn close<S>(sender: &mut S, code: u16, reason: &'static str)
where
    S: futures::Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
