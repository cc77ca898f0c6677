use axum::routing::{get, post};
use axum::Router;

use crate::chat::{groups, messages};
use crate::state::AppState;
use crate::ws::handler::ws_upgrade;

/// Assemble the full HTTP surface: the chat REST API, the WebSocket
/// endpoint, and a liveness probe.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chats/users", get(messages::list_chat_users))
        .route("/api/chats/unread", get(messages::get_unread_counts))
        .route(
            "/api/chats/messages/{userId}",
            get(messages::get_conversation),
        )
        .route("/api/chats/messages", post(messages::send_message))
        .route(
            "/api/chats/read/{userId}",
            post(messages::mark_conversation_read),
        )
        .route("/api/chats/groups", get(groups::list_groups))
        .route("/api/chats/groups/unread", get(groups::get_group_unread_counts))
        .route(
            "/api/chats/groups/task/{taskId}",
            post(groups::ensure_group),
        )
        .route(
            "/api/chats/groups/task/{taskId}/messages",
            get(groups::get_group_messages).post(groups::send_group_message),
        )
        .route(
            "/api/chats/groups/task/{taskId}/read",
            post(groups::mark_group_read),
        )
        .route("/ws", get(ws_upgrade))
        .route("/health", get(|| async { "ok" }))
        .with_state(state)
}
