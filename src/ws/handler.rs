use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::actor;

/// Query parameters for WebSocket connection. One socket per browser
/// session, tagged with the account it belongs to.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

/// WebSocket close codes:
/// 4001 = userId missing or non-numeric
/// 4004 = no such user
const CLOSE_INVALID_USER_ID: u16 = 4001;
const CLOSE_UNKNOWN_USER: u16 = 4004;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// GET /ws?userId=N
/// WebSocket upgrade endpoint. The userId must resolve to an existing user
/// record; otherwise the socket is closed immediately without registering.
/// On success, spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = params
        .user_id
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok());

    let Some(user_id) = user_id else {
        tracing::warn!(raw = ?params.user_id, "WebSocket handshake with invalid userId");
        return refuse(ws, CLOSE_INVALID_USER_ID, "Missing or invalid userId");
    };

    match state.store.get_user(user_id).await {
        Ok(Some(_)) => {
            tracing::info!(user_id, "WebSocket connection accepted");
            ws.on_upgrade(move |socket| actor::run_connection(socket, state, user_id))
        }
        Ok(None) => {
            tracing::warn!(user_id, "WebSocket handshake for unknown user");
            refuse(ws, CLOSE_UNKNOWN_USER, "Unknown user")
        }
        Err(e) => {
            tracing::error!(user_id, error = %e, "User lookup failed during handshake");
            refuse(ws, CLOSE_INTERNAL_ERROR, "Internal error")
        }
    }
}

/// Upgrade the connection, then immediately close with the given code.
/// The handshake has already succeeded at the HTTP layer by the time we can
/// see the query parameters, so refusal is a close frame, not a 4xx.
fn refuse(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    })
}
