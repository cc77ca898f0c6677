//! Integration tests for WebSocket auth, the unread snapshot, multi-tab
//! fan-out, and active-room read semantics.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use taskboard_server::state::AppState;
use taskboard_server::store::Store;

type WsRead = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;
type WsWrite = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Start the server on a random port with a fresh database.
/// Returns (base_url, addr, state); the state handle lets tests seed data.
async fn start_test_server() -> (String, SocketAddr, AppState) {
    start_test_server_with_ring_timeout(Duration::from_secs(30)).await
}

async fn start_test_server_with_ring_timeout(
    ring_timeout: Duration,
) -> (String, SocketAddr, AppState) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = taskboard_server::db::init_db(&data_dir).expect("Failed to init DB");
    let state = AppState::new(Store::new(db), ring_timeout);

    let app = taskboard_server::routes::build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
        let _keep = tmp_dir;
    });

    let base_url = format!("http://{}", addr);
    (base_url, addr, state)
}

/// Create a user directly through the store and return its id.
async fn create_user(state: &AppState, name: &str) -> i64 {
    let email = format!("{}@example.com", name.to_lowercase());
    state
        .store
        .create_user(name, &email, "changeme")
        .await
        .expect("Failed to create user")
        .id
}

/// Connect a WebSocket for a user and consume the initial unread snapshot.
async fn connect(addr: SocketAddr, user_id: i64) -> (WsWrite, WsRead) {
    let ws_url = format!("ws://{}/ws?userId={}", addr, user_id);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    let (write, mut read) = ws_stream.split();

    let snapshot = recv_event(&mut read).await.expect("Expected unread snapshot");
    assert_eq!(snapshot["type"], "unread:update");

    (write, read)
}

/// Next JSON text frame within a timeout; None on timeout.
async fn recv_event(read: &mut WsRead) -> Option<Value> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Some(serde_json::from_str(text.as_str()).expect("Invalid JSON frame"));
            }
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Read frames until one with the given `type` arrives, failing on timeout.
async fn expect_event(read: &mut WsRead, event_type: &str) -> Value {
    loop {
        let event = recv_event(read)
            .await
            .unwrap_or_else(|| panic!("Timed out waiting for {}", event_type));
        if event["type"] == event_type {
            return event;
        }
    }
}

/// Send a DM over the REST API as the given user.
async fn send_dm(base_url: &str, from: i64, to: i64, content: &str) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{}/api/chats/messages", base_url))
        .header("x-user-id", from.to_string())
        .json(&json!({ "toUserId": to, "content": content }))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_ws_rejects_missing_or_invalid_user_id() {
    let (_base_url, addr, _state) = start_test_server().await;

    for url in [
        format!("ws://{}/ws", addr),
        format!("ws://{}/ws?userId=abc", addr),
    ] {
        let (ws_stream, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("Upgrade should succeed before refusal");
        let (_write, mut read) = ws_stream.split();

        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("Expected close within timeout");
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 4001, "Expected close code 4001");
            }
            other => panic!("Expected close frame, got: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_ws_rejects_unknown_user() {
    let (_base_url, addr, _state) = start_test_server().await;

    let ws_url = format!("ws://{}/ws?userId=999", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let (_write, mut read) = ws_stream.split();

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4004, "Expected close code 4004");
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_initial_snapshot_reflects_stored_unreads() {
    let (base_url, addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    let resp = send_dm(&base_url, alice, bob, "hello").await;
    assert_eq!(resp.status(), 201);

    // Bob connects after the fact: the snapshot already counts the message.
    let ws_url = format!("ws://{}/ws?userId={}", addr, bob);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let (_write, mut read) = ws_stream.split();

    let snapshot = expect_event(&mut read, "unread:update").await;
    assert_eq!(snapshot["payload"]["total"], 1);
    assert_eq!(snapshot["payload"]["byUser"][alice.to_string()], 1);
}

#[tokio::test]
async fn test_new_message_notifies_every_recipient_tab() {
    let (base_url, addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    let (_w1, mut tab1) = connect(addr, bob).await;
    let (_w2, mut tab2) = connect(addr, bob).await;

    let resp = send_dm(&base_url, alice, bob, "ping").await;
    assert_eq!(resp.status(), 201);

    for read in [&mut tab1, &mut tab2] {
        let event = expect_event(read, "message:new").await;
        assert_eq!(event["payload"]["fromUserId"], alice);
        assert_eq!(event["payload"]["toUserId"], bob);
        let unread = expect_event(read, "unread:update").await;
        assert_eq!(unread["payload"]["total"], 1);
    }
}

#[tokio::test]
async fn test_active_room_marks_read_at_creation() {
    let (base_url, addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    let (mut bob_write, mut bob_read) = connect(addr, bob).await;
    let (_alice_write, mut alice_read) = connect(addr, alice).await;

    // Bob opens Alice's conversation in one tab.
    bob_write
        .send(Message::Text(
            json!({
                "type": "chat:active-room",
                "payload": { "activeUserId": alice }
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();

    // The declaration triggers a mark-read, which pushes a fresh snapshot.
    let unread = expect_event(&mut bob_read, "unread:update").await;
    assert_eq!(unread["payload"]["total"], 0);

    let resp = send_dm(&base_url, alice, bob, "are you there?").await;
    assert_eq!(resp.status(), 201);
    let message: Value = resp.json().await.unwrap();
    assert!(
        !message["readAt"].is_null(),
        "Message to a viewing recipient is stamped read at creation"
    );

    // Bob still gets the refetch hint, and his unread total stays zero.
    expect_event(&mut bob_read, "message:new").await;
    let unread = expect_event(&mut bob_read, "unread:update").await;
    assert_eq!(unread["payload"]["total"], 0);

    // Alice sees the read receipt immediately.
    let read_event = expect_event(&mut alice_read, "chat:read").await;
    assert_eq!(read_event["payload"]["userId"], bob);
}

#[tokio::test]
async fn test_mark_read_endpoint_notifies_sender() {
    let (base_url, addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    let (_alice_write, mut alice_read) = connect(addr, alice).await;
    send_dm(&base_url, alice, bob, "unread for now").await;

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chats/read/{}", base_url, alice))
        .header("x-user-id", bob.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let read_event = expect_event(&mut alice_read, "chat:read").await;
    assert_eq!(read_event["payload"]["userId"], bob);
}

#[tokio::test]
async fn test_malformed_and_self_room_frames_are_ignored() {
    let (base_url, addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    let (mut bob_write, mut bob_read) = connect(addr, bob).await;

    for frame in [
        "not json".to_string(),
        json!({ "type": "nope", "payload": {} }).to_string(),
        json!({ "type": "webrtc:signal", "payload": {} }).to_string(),
        // Declaring your own id as the active room is a no-op.
        json!({ "type": "chat:active-room", "payload": { "activeUserId": bob } }).to_string(),
    ] {
        bob_write.send(Message::Text(frame.into())).await.unwrap();
    }

    // Connection survives and still dispatches normally.
    send_dm(&base_url, alice, bob, "still alive?").await;
    let event = expect_event(&mut bob_read, "message:new").await;
    assert_eq!(event["payload"]["fromUserId"], alice);

    // The self-declare must not have marked anything read.
    let unread = expect_event(&mut bob_read, "unread:update").await;
    assert_eq!(unread["payload"]["total"], 1);
}

#[tokio::test]
async fn test_registry_entry_dropped_after_disconnect() {
    let (_base_url, addr, state) = start_test_server().await;
    let bob = create_user(&state, "Bob").await;

    let (mut bob_write, _bob_read) = connect(addr, bob).await;
    assert!(state.connections.contains_key(&bob));

    bob_write.send(Message::Close(None)).await.unwrap();
    drop(bob_write);

    // Teardown finishes asynchronously; the entry must go away, not linger
    // as a set of dead senders.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.connections.contains_key(&bob) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Registry entry still present after disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_closing_viewing_tab_releases_room() {
    let (base_url, addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    // Bob has two tabs; only tab A opens Alice's conversation.
    let (mut tab_a_write, mut tab_a_read) = connect(addr, bob).await;
    let (_tab_b_write, mut tab_b_read) = connect(addr, bob).await;

    tab_a_write
        .send(Message::Text(
            json!({
                "type": "chat:active-room",
                "payload": { "activeUserId": alice }
            })
            .to_string()
            .into(),
        ))
        .await
        .unwrap();
    expect_event(&mut tab_a_read, "unread:update").await;

    // While tab A is viewing, a message arrives already read and every tab
    // sees the unchanged zero total.
    let resp = send_dm(&base_url, alice, bob, "first").await;
    let message: Value = resp.json().await.unwrap();
    assert!(!message["readAt"].is_null());
    for read in [&mut tab_a_read, &mut tab_b_read] {
        expect_event(read, "message:new").await;
        let unread = expect_event(read, "unread:update").await;
        assert_eq!(unread["payload"]["total"], 0);
    }

    // Tab A closes without clearing its room; the refcount must not leak.
    tab_a_write.send(Message::Close(None)).await.unwrap();
    drop(tab_a_write);
    drop(tab_a_read);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.rooms.is_viewing(bob, alice) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "Room refcount still held after the viewing tab closed"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Nobody is viewing any more: the next message goes unread for tab B.
    let resp = send_dm(&base_url, alice, bob, "second").await;
    let message: Value = resp.json().await.unwrap();
    assert!(message["readAt"].is_null());

    expect_event(&mut tab_b_read, "message:new").await;
    let unread = expect_event(&mut tab_b_read, "unread:update").await;
    assert_eq!(unread["payload"]["total"], 1);
    assert_eq!(unread["payload"]["byUser"][alice.to_string()], 1);
}

#[tokio::test]
async fn test_send_message_validation() {
    let (base_url, _addr, state) = start_test_server().await;
    let alice = create_user(&state, "Alice").await;
    let bob = create_user(&state, "Bob").await;

    let resp = send_dm(&base_url, alice, bob, "   ").await;
    assert_eq!(resp.status(), 400, "Whitespace-only content rejected");

    let resp = send_dm(&base_url, alice, alice, "hi me").await;
    assert_eq!(resp.status(), 400, "Self-send rejected");

    let resp = send_dm(&base_url, alice, 999, "anyone?").await;
    assert_eq!(resp.status(), 404, "Unknown recipient rejected");

    let long = "x".repeat(4001);
    let resp = send_dm(&base_url, alice, bob, &long).await;
    assert_eq!(resp.status(), 413, "Oversized content rejected");

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chats/messages", base_url))
        .json(&json!({ "toUserId": bob, "content": "no identity" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401, "Missing X-User-Id rejected");
}
