//! Wire protocol: tagged-union decode of inbound frames and the catalog of
//! outbound events the frontend depends on.
//!
//! Every frame is a single JSON text message `{ "type": ..., "payload": ... }`.
//! Malformed JSON, unknown types, and missing fields are silently dropped —
//! the protocol has no negative-acknowledgement channel, and bad input must
//! never crash or desynchronize the connection.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::call;
use crate::state::AppState;
use crate::store::UnreadCounts;
use crate::ws::broadcast::{emit, push_unread_counts};

/// Inbound client frames, one variant per `type` value.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    /// Relay a call-negotiation payload to one peer.
    #[serde(rename = "webrtc:signal")]
    WebrtcSignal(SignalPayload),
    /// Declare which peer's conversation this connection is viewing.
    #[serde(rename = "chat:active-room")]
    ActiveRoom(ActiveRoomPayload),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub to_user_id: i64,
    /// Opaque negotiation blob; only its `type` discriminator is examined.
    pub signal: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveRoomPayload {
    /// None clears the declared room.
    #[serde(default)]
    pub active_user_id: Option<i64>,
}

/// Outbound server events. Payload shapes are contracts the frontend
/// depends on — field names stay camelCase on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "unread:update")]
    UnreadUpdate(UnreadCounts),
    /// Hint to refetch the conversation, not the message body itself.
    #[serde(rename = "message:new", rename_all = "camelCase")]
    MessageNew { from_user_id: i64, to_user_id: i64 },
    /// The named user has read the receiver's messages.
    #[serde(rename = "chat:read", rename_all = "camelCase")]
    ChatRead { user_id: i64 },
    #[serde(rename = "webrtc:signal", rename_all = "camelCase")]
    WebrtcSignal {
        from_user_id: i64,
        signal: serde_json::Value,
    },
    #[serde(rename = "task-group:created", rename_all = "camelCase")]
    TaskGroupCreated { task_id: i64 },
    #[serde(rename = "task-group:new", rename_all = "camelCase")]
    TaskGroupNew { task_id: i64, from_user_id: i64 },
    #[serde(rename = "task-group:read", rename_all = "camelCase")]
    TaskGroupRead { task_id: i64 },
}

/// Handle one inbound text frame from an authenticated connection.
/// `declared_room` is the connection's own active-room declaration, owned by
/// the actor so teardown on close is a single local operation.
pub async fn handle_text_frame(
    text: &str,
    state: &AppState,
    user_id: i64,
    declared_room: &mut Option<i64>,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(user_id, error = %e, "Dropping malformed frame");
            return;
        }
    };

    match frame {
        ClientFrame::WebrtcSignal(payload) => {
            // fromUserId is always the authenticated connection, never the payload.
            call::handle_signal(state, user_id, payload.to_user_id, payload.signal);
        }
        ClientFrame::ActiveRoom(payload) => {
            apply_active_room(state, user_id, declared_room, payload.active_user_id).await;
        }
    }
}

/// Switch this connection's declared room: release the old pair, claim the
/// new one, then synchronously mark the peer's messages read and push fresh
/// unread counts so no badge lingers.
pub async fn apply_active_room(
    state: &AppState,
    user_id: i64,
    declared_room: &mut Option<i64>,
    new_room: Option<i64>,
) {
    // Self-chat is disallowed everywhere in this system.
    if new_room == Some(user_id) {
        tracing::debug!(user_id, "Ignoring self active-room declaration");
        return;
    }

    if let Some(old_peer) = declared_room.take() {
        state.rooms.end_viewing(user_id, old_peer);
    }

    let Some(peer) = new_room else {
        return;
    };
    state.rooms.begin_viewing(user_id, peer);
    *declared_room = Some(peer);

    match state.store.mark_messages_as_read(user_id, peer).await {
        Ok(changed) => {
            if changed > 0 {
                emit(&state.connections, peer, &ServerEvent::ChatRead { user_id });
            }
            push_unread_counts(state, user_id).await;
        }
        Err(e) => {
            // A failed mark-read must not tear down the connection.
            tracing::warn!(user_id, peer, error = %e, "Failed to mark room read");
        }
    }
}

/// Build an `unread:update` event from raw counts.
pub fn unread_update(total: i64, by_user: HashMap<String, i64>) -> ServerEvent {
    ServerEvent::UnreadUpdate(UnreadCounts { total, by_user })
}
