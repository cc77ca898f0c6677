//! Direct-message REST surface.
//!
//! Handlers persist first, then notify over the connection registry. A
//! recipient with no live connections simply misses the push; the store is
//! the system of record and the next fetch reconciles.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::CurrentUser;
use crate::db::models::{Message, User};
use crate::state::AppState;
use crate::store::{self, StoreError, UnreadCounts, MAX_CONTENT_LENGTH};
use crate::ws::broadcast::{emit, push_unread_counts};
use crate::ws::protocol::ServerEvent;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub to_user_id: i64,
    pub content: String,
}

fn internal(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "Store operation failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /api/chats/users — the DM roster: everyone except the caller.
pub async fn list_chat_users(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<Vec<User>>, StatusCode> {
    let users = state
        .store
        .get_users_except(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(users))
}

/// GET /api/chats/unread — current unread DM counts for the caller.
pub async fn get_unread_counts(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
) -> Result<Json<UnreadCounts>, StatusCode> {
    let counts = state
        .store
        .unread_counts_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(Json(counts))
}

/// GET /api/chats/messages/{userId} — full conversation with one peer,
/// oldest first.
pub async fn get_conversation(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(other_user_id): Path<i64>,
) -> Result<Json<Vec<Message>>, StatusCode> {
    let messages = state
        .store
        .messages_between(user_id, other_user_id)
        .await
        .map_err(internal)?;
    Ok(Json(messages))
}

/// POST /api/chats/messages — send a DM.
///
/// If the recipient's client has declared it is viewing the sender's
/// conversation, the message is stamped read at creation so the recipient
/// never sees an unread flash for a conversation they are looking at.
pub async fn send_message(
    State(state): State<AppState>,
    CurrentUser(from_user_id): CurrentUser,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), StatusCode> {
    let content = req.content.trim();
    if content.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    if content.chars().count() > MAX_CONTENT_LENGTH {
        return Err(StatusCode::PAYLOAD_TOO_LARGE);
    }
    if req.to_user_id == from_user_id {
        return Err(StatusCode::BAD_REQUEST);
    }

    let recipient = state
        .store
        .get_user(req.to_user_id)
        .await
        .map_err(internal)?;
    if recipient.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }

    // Presence decides read-at-creation; the stored row stays authoritative.
    let eager_read = state.rooms.is_viewing(req.to_user_id, from_user_id);
    let read_at = eager_read.then(store::now_rfc3339);

    let message = state
        .store
        .create_message(from_user_id, req.to_user_id, content, read_at)
        .await
        .map_err(internal)?;

    emit(
        &state.connections,
        req.to_user_id,
        &ServerEvent::MessageNew {
            from_user_id,
            to_user_id: req.to_user_id,
        },
    );
    // Pushed even when counts are unchanged, so every tab converges.
    push_unread_counts(&state, req.to_user_id).await;

    if eager_read {
        emit(
            &state.connections,
            from_user_id,
            &ServerEvent::ChatRead {
                user_id: req.to_user_id,
            },
        );
    }

    Ok((StatusCode::CREATED, Json(message)))
}

/// POST /api/chats/read/{userId} — mark every message from that peer read.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(peer_user_id): Path<i64>,
) -> Result<Json<Value>, StatusCode> {
    let changed = state
        .store
        .mark_messages_as_read(user_id, peer_user_id)
        .await
        .map_err(internal)?;

    push_unread_counts(&state, user_id).await;
    if changed > 0 {
        emit(
            &state.connections,
            peer_user_id,
            &ServerEvent::ChatRead { user_id },
        );
    }

    Ok(Json(json!({ "success": true })))
}
