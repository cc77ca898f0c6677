//! Push primitives over the connection registry.

use axum::extract::ws::Message;

use super::ConnectionRegistry;
use crate::state::AppState;
use crate::ws::protocol::ServerEvent;

/// Serialize an event into a WebSocket text frame.
pub fn event_message(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server event");
            None
        }
    }
}

/// Send an event to every live connection of one user.
/// Serialized once; a user with no connections is a silent no-op.
pub fn emit(registry: &ConnectionRegistry, user_id: i64, event: &ServerEvent) {
    let Some(msg) = event_message(event) else {
        return;
    };
    if let Some(connections) = registry.get(&user_id) {
        for sender in connections.value().iter() {
            // Best-effort: a closed sender just means that tab is gone.
            let _ = sender.send(msg.clone());
        }
    }
}

/// Recompute a user's unread DM counts from the store and push them to all
/// of their connections. A store failure is logged and absorbed — one failed
/// push must not prevent future pushes or affect unrelated connections.
pub async fn push_unread_counts(state: &AppState, user_id: i64) {
    match state.store.unread_counts_for_user(user_id).await {
        Ok(counts) => emit(
            &state.connections,
            user_id,
            &ServerEvent::UnreadUpdate(counts),
        ),
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Failed to push unread counts");
        }
    }
}
