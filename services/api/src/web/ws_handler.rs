//! services/api/src/web/ws_handler.rs
//!
//! This is the main entry point for a live-view WebSocket connection. The first
//! message selects the view; the matching task then owns the socket until close.

use crate::web::{
    profile_task::{profile_process, ProfileSession},
    protocol::{ClientMessage, ServerMessage, ViewKind},
    roster_task::{roster_process, RosterSession},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use fee_portal_core::domain::Principal;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::Arc;
use tracing::{error, info, warn};

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, principal))
}

/// Serializes and sends one message. Returns `false` once the client is gone.
pub async fn send_message<S>(ws_sender: &mut S, message: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize server message: {}", e);
            return true;
        }
    };
    ws_sender.send(Message::Text(json.into())).await.is_ok()
}

async fn handle_socket(socket: WebSocket, app_state: Arc<AppState>, principal: Principal) {
    info!("New WebSocket connection established for user: {}", principal.user_id);
    let (mut ws_sender, mut receiver) = socket.split();
    serve_connection(&mut ws_sender, &mut receiver, app_state, principal.clone()).await;
    info!("WebSocket connection closed for user: {}", principal.user_id);
}

/// Runs one live-view connection over any message sink and stream.
pub async fn serve_connection<S, R>(
    ws_sender: &mut S,
    receiver: &mut R,
    app_state: Arc<AppState>,
    principal: Principal,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    // --- 1. Initialization Phase ---
    let init = match receiver.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<ClientMessage>(text.as_str()),
        _ => {
            info!("Client disconnected before sending Init message.");
            return;
        }
    };

    // --- 2. Hand the socket to the selected view ---
    match init {
        Ok(ClientMessage::Init {
            view: ViewKind::Roster,
            search,
            status,
        }) => {
            let session = RosterSession::open(&app_state.student_rows(), search, status).await;
            roster_process(session, ws_sender, receiver).await;
        }
        Ok(ClientMessage::Init {
            view: ViewKind::Profile,
            ..
        }) => {
            let session = ProfileSession::open(app_state, principal).await;
            profile_process(session, ws_sender, receiver).await;
        }
        Ok(other) => {
            warn!("First message was not an Init message: {:?}", other);
            send_message(ws_sender, &ServerMessage::error("Expected an init message")).await;
        }
        Err(e) => {
            warn!("Failed to deserialize Init message: {}", e);
            send_message(ws_sender, &ServerMessage::error("Invalid init message")).await;
        }
    }
}
