use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::call;
use crate::state::AppState;
use crate::ws::broadcast::event_message;
use crate::ws::protocol::{self, ServerEvent};
use crate::ws::ConnectionSender;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for a validated WebSocket.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader task: processes incoming frames in order, dispatches to protocol handlers
///
/// The mpsc channel allows any part of the system to push events to this
/// client by cloning the sender out of the connection registry.
pub async fn run_connection(socket: WebSocket, state: AppState, user_id: i64) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Register this connection in the connection registry
    register_connection(&state, user_id, tx.clone());

    // Push the current unread snapshot to this connection only
    match state.store.unread_counts_for_user(user_id).await {
        Ok(counts) => {
            if let Some(msg) = event_message(&ServerEvent::UnreadUpdate(counts)) {
                let _ = tx.send(msg);
            }
        }
        Err(e) => {
            tracing::warn!(user_id, error = %e, "Failed to load initial unread counts");
        }
    }

    tracing::info!(user_id, "WebSocket actor started");

    // Spawn writer task: forwards mpsc messages to WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(PING_INTERVAL);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(PONG_TIMEOUT, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }
    });

    // This connection's declared active room. Owned here so teardown on any
    // exit path is a single local decrement, never a search.
    let mut declared_room: Option<i64> = None;

    // Reader loop: process incoming WebSocket messages in order
    loop {
        match ws_receiver.next().await {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    protocol::handle_text_frame(text.as_str(), &state, user_id, &mut declared_room)
                        .await;
                }
                Message::Binary(_) => {
                    // The protocol is JSON text frames only
                    tracing::debug!(user_id, "Dropping unexpected binary frame");
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(user_id, reason = ?frame, "Client initiated close");
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(user_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!(user_id, "WebSocket stream ended");
                break;
            }
        }
    }

    // Cleanup: abort writer and ping tasks. Abort is asynchronous, and the
    // registry prune below keys off sender.is_closed(), which only flips
    // once the writer task's receiver is dropped — so wait for the writer
    // to actually finish before unregistering.
    writer_handle.abort();
    ping_handle.abort();
    let _ = writer_handle.await;

    // Unwind everything this connection owns: room refcount, call session,
    // registry entry. Partial cleanup here is a correctness bug.
    if let Some(peer) = declared_room.take() {
        state.rooms.end_viewing(user_id, peer);
    }
    call::hangup_on_disconnect(&state, user_id);
    unregister_connection(&state, user_id);

    tracing::info!(user_id, "WebSocket actor stopped");
}

/// Writer task: receives messages from mpsc channel and forwards them to the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}

/// Register a connection sender in the connection registry.
fn register_connection(state: &AppState, user_id: i64, tx: ConnectionSender) {
    state.connections.entry(user_id).or_default().push(tx);

    let conn_count = state
        .connections
        .get(&user_id)
        .map(|v| v.len())
        .unwrap_or(0);
    tracing::debug!(user_id, connections = conn_count, "Connection registered");
}

/// Remove closed connections from the registry for a user.
/// After the reader loop exits, this actor's receiver is gone, so its sender
/// reports closed. Dropping the user's entry entirely when the set empties
/// keeps the registry free of dangling users.
fn unregister_connection(state: &AppState, user_id: i64) {
    let mut remove_user = false;

    if let Some(mut connections) = state.connections.get_mut(&user_id) {
        connections.retain(|sender| !sender.is_closed());
        if connections.is_empty() {
            remove_user = true;
        }
    }

    if remove_user {
        state.connections.remove(&user_id);
    }

    tracing::debug!(user_id, "Connection unregistered");
}
