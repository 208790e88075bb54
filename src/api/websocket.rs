use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::warn;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::hub::run_session;

#[derive(Deserialize)]
pub struct WsAuth {
    token: Option<String>,
}

/// WebSocket handler. Requires a valid bearer token via `?token=`.
/// Token-at-upgrade is the single reauth path; an expired token means a new
/// connection, never an in-band renegotiation.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(auth): Query<WsAuth>,
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let token = auth
        .token
        .as_deref()
        .ok_or_else(|| ApiError::unauthorized("missing token"))?;
    if let Err(e) = state.auth.verify(token) {
        warn!("WebSocket connection rejected: {e}");
        return Err(e.into());
    }

    let hub = state.hub.clone();
    let config = state.ws;
    Ok(ws
        .max_message_size(config.max_message_bytes)
        .on_upgrade(move |socket| run_session(socket, hub, config)))
}
