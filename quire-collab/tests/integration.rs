//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real relay and connect real clients,
//! verifying the full sync pipeline.

use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use uuid::Uuid;

use quire_collab::client::{ClientConfig, StaticToken, SyncClient};
use quire_collab::editor::{EditError, EditorSession};
use quire_collab::protocol::{HelloPayload, MessageType, PeerInfo, SyncMessage};
use quire_collab::server::{ServerConfig, ServerHandle, SyncServer};
use quire_collab::session::{ConnectionState, SessionConfig};

const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on an ephemeral port.
async fn start_test_server(token: Option<&str>) -> ServerHandle {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        broadcast_capacity: 64,
        auth_token: token.map(str::to_string),
    };
    SyncServer::new(config).bind().await.unwrap()
}

/// Client config with short retry delays.
fn fast_config(url: &str) -> ClientConfig {
    ClientConfig {
        session: SessionConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
        },
        ..ClientConfig::new(url)
    }
}

fn session(name: &str, doc_id: Uuid, url: &str, token: StaticToken) -> EditorSession {
    EditorSession::new(PeerInfo::new(name), doc_id, fast_config(url), token)
}

/// Poll `check` until it holds or the deadline passes.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "Timed out waiting for: {what}");
        sleep(Duration::from_millis(10)).await;
    }
}

async fn connected(name: &str, doc_id: Uuid, url: &str) -> EditorSession {
    connected_with(name, doc_id, fast_config(url)).await
}

async fn connected_with(name: &str, doc_id: Uuid, config: ClientConfig) -> EditorSession {
    let mut s = EditorSession::new(PeerInfo::new(name), doc_id, config, StaticToken::none());
    s.connect().await.unwrap();
    eventually("editing enabled", || s.editing_enabled()).await;
    s
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let server = start_test_server(None).await;
    let result = tokio_tungstenite::connect_async(server.url()).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_raw_handshake_welcome_then_sync_complete() {
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let server = start_test_server(None).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(server.url()).await.unwrap();

    let peer = PeerInfo::new("Raw");
    let doc_id = Uuid::new_v4();
    let hello = SyncMessage::hello(doc_id, &HelloPayload { peer: peer.clone(), token: None }).unwrap();
    ws.send(Message::Binary(hello.encode().unwrap().into())).await.unwrap();

    let mut types = Vec::new();
    while types.len() < 2 {
        match timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => types.push(SyncMessage::decode(&data).unwrap().msg_type),
            Some(Ok(_)) => {}
            other => panic!("Unexpected frame: {other:?}"),
        }
    }
    assert_eq!(types, vec![MessageType::Welcome, MessageType::SyncComplete]);

    let room = server.room_manager().get(&doc_id).await.unwrap();
    assert!(room.has_peer(&peer.peer_id).await);
}

#[tokio::test]
async fn test_client_connects_and_syncs() {
    let server = start_test_server(None).await;
    let mut client = SyncClient::new(
        PeerInfo::new("Alice"),
        Uuid::new_v4(),
        fast_config(&server.url()),
        StaticToken::none(),
    );
    let mut status = client.subscribe_status();
    client.connect().await.unwrap();

    let reached = timeout(WAIT, status.wait_for(|s| s.editing_enabled())).await;
    assert!(reached.is_ok(), "Client should reach Connected + synced");
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.status().retry_count, 0);
}

#[tokio::test]
async fn test_concurrent_inserts_converge() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    let bob = connected("Bob", doc_id, &url).await;

    alice.apply_local_edit(0, "Hello", 0).unwrap();
    bob.apply_local_edit(0, "Hi ", 0).unwrap();

    eventually("both replicas hold all 8 chars", || {
        alice.plain_text().chars().count() == 8 && bob.plain_text().chars().count() == 8
    })
    .await;

    let text = alice.plain_text();
    assert_eq!(text, bob.plain_text());
    assert!(text == "HelloHi " || text == "Hi Hello", "unexpected merge: {text:?}");
}

#[tokio::test]
async fn test_edits_and_deletes_replicate() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    let bob = connected("Bob", doc_id, &url).await;

    alice.apply_local_edit(0, "Hello world", 0).unwrap();
    eventually("bob sees insert", || bob.plain_text() == "Hello world").await;

    bob.apply_local_edit(5, "", 6).unwrap();
    eventually("alice sees delete", || alice.plain_text() == "Hello").await;
}

#[tokio::test]
async fn test_annotation_replicates_and_tracks_text() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    let bob = connected("Bob", doc_id, &url).await;

    alice.apply_local_edit(0, "say world", 0).unwrap();
    eventually("bob sees text", || bob.plain_text() == "say world").await;

    let note = alice.add_annotation(4, 5, "alice", "check this").unwrap();
    eventually("bob sees annotation", || bob.resolve_annotations().len() == 1).await;

    // Text inserted before the span shifts it on both replicas.
    bob.apply_local_edit(0, "hey, ", 0).unwrap();
    eventually("alice sees prefix", || alice.plain_text() == "hey, say world").await;

    let resolved = alice.resolve_annotations();
    assert_eq!(resolved[0].id, note.id);
    assert_eq!(resolved[0].current_index, Some(9));
    assert_eq!(resolved[0].current_length, 5);

    alice.remove_annotation(&note.id).unwrap();
    eventually("bob sees removal", || bob.resolve_annotations().is_empty()).await;
}

#[tokio::test]
async fn test_late_joiner_receives_backlog() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    alice.apply_local_edit(0, "abc", 0).unwrap();
    alice.add_annotation(1, 1, "alice", "b?").unwrap();

    let room = server.room_manager().get(&doc_id).await.unwrap();
    let deadline = Instant::now() + WAIT;
    while room.backlog_len().await < 2 {
        assert!(Instant::now() < deadline, "relay never recorded alice's edits");
        sleep(Duration::from_millis(10)).await;
    }

    let late = connected("Late", doc_id, &url).await;
    assert!(late.synced());
    eventually("late joiner has text", || late.plain_text() == "abc").await;
    eventually("late joiner has annotation", || late.resolve_annotations().len() == 1).await;
    assert_eq!(late.resolve_annotations()[0].current_index, Some(1));
}

#[tokio::test]
async fn test_bad_token_fails_unauthorized() {
    let server = start_test_server(Some("secret")).await;
    let mut s = session("Mallory", Uuid::new_v4(), &server.url(), StaticToken::new("wrong"));
    s.connect().await.unwrap();

    eventually("failed", || s.connection_state() == ConnectionState::Failed).await;
    let error = s.connection_error().unwrap();
    assert!(error.starts_with("unauthorized"), "unexpected error: {error}");
    assert_eq!(s.status().retry_count, 1, "unauthorized must not retry");
    assert!(server.stats().await.rejected_connections >= 1);

    // Failed is terminal: no automatic reconnection.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(s.connection_state(), ConnectionState::Failed);
    assert_eq!(s.status().retry_count, 1);
}

#[tokio::test]
async fn test_good_token_connects() {
    let server = start_test_server(Some("secret")).await;
    let mut s = session("Alice", Uuid::new_v4(), &server.url(), StaticToken::new("secret"));
    s.connect().await.unwrap();
    eventually("editing enabled", || s.editing_enabled()).await;
}

#[tokio::test]
async fn test_editing_disabled_while_offline() {
    // Reserve a port, then close it so nothing listens there.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let mut s = session("Alice", Uuid::new_v4(), &format!("ws://{addr}"), StaticToken::none());
    s.connect().await.unwrap();

    assert!(matches!(
        s.apply_local_edit(0, "x", 0),
        Err(EditError::EditingDisabled(_))
    ));

    eventually("retry budget exhausted", || s.connection_state() == ConnectionState::Failed).await;
    assert_eq!(s.status().retry_count, 3);
    assert!(s.connection_error().unwrap().contains("retry limit exceeded"));
    assert_eq!(s.plain_text(), "");
}

#[tokio::test]
async fn test_presence_announce_and_peer_left() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    let mut bob = connected("Bob", doc_id, &url).await;

    eventually("alice sees bob", || {
        alice.remote_presence().iter().any(|p| p.display_name == "Bob")
    })
    .await;
    // Bob learns about Alice from her reply to his announce.
    eventually("bob sees alice", || {
        bob.remote_presence().iter().any(|p| p.display_name == "Alice")
    })
    .await;

    bob.shutdown().await;
    eventually("alice forgets bob", || alice.remote_presence().is_empty()).await;
    eventually("bob idle", || bob.connection_state() == ConnectionState::Idle).await;
}

#[tokio::test]
async fn test_remote_cursor_resolves() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    let bob = connected("Bob", doc_id, &url).await;

    alice.apply_local_edit(0, "abcdef", 0).unwrap();
    eventually("bob sees text", || bob.plain_text() == "abcdef").await;

    alice.move_cursor(3);
    let alice_id = alice.peer_id();
    eventually("bob sees alice's cursor", || bob.remote_cursor_index(&alice_id) == Some(3)).await;
}

#[tokio::test]
async fn test_presence_cleared_when_relay_stops() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let alice = connected("Alice", doc_id, &url).await;
    let bob = connected("Bob", doc_id, &url).await;
    eventually("presence exchanged", || {
        alice.remote_presence().len() == 1 && bob.remote_presence().len() == 1
    })
    .await;

    server.shutdown().await;

    eventually("alice offline", || alice.connection_state() != ConnectionState::Connected).await;
    eventually("alice presence purged", || alice.remote_presence().is_empty()).await;
    eventually("bob presence purged", || bob.remote_presence().is_empty()).await;
    assert!(!alice.editing_enabled());
    assert!(matches!(
        alice.apply_local_edit(0, "x", 0),
        Err(EditError::EditingDisabled(_))
    ));

    eventually("alice gives up", || alice.connection_state() == ConnectionState::Failed).await;
}

#[tokio::test]
async fn test_reconnect_replays_offline_edits() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let mut alice = connected("Alice", doc_id, &url).await;
    let bob = connected("Bob", doc_id, &url).await;

    alice.apply_local_edit(0, "one", 0).unwrap();
    eventually("bob sees first edit", || bob.plain_text() == "one").await;

    // Annotations may be created offline; they are queued and replayed.
    alice.shutdown().await;
    let note = alice.add_annotation(0, 3, "alice", "offline note").unwrap();
    alice.connect().await.unwrap();
    eventually("alice back", || alice.editing_enabled()).await;

    eventually("bob sees offline annotation", || {
        bob.resolve_annotations().iter().any(|r| r.id == note.id)
    })
    .await;
    assert_eq!(alice.plain_text(), "one");
}

#[tokio::test]
async fn test_edit_larger_than_outgoing_channel_converges() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let small_channel = ClientConfig {
        outgoing_capacity: 8,
        ..fast_config(&url)
    };
    let alice = connected_with("Alice", doc_id, small_channel).await;
    let bob = connected("Bob", doc_id, &url).await;

    let text = "x".repeat(2000);
    alice.apply_local_edit(0, &text, 0).unwrap();
    eventually("bob sees 2000 chars", || bob.plain_text().len() == 2000).await;

    // 2000 deletes from one edit, far more than the channel holds.
    alice.apply_local_edit(0, "", 2000).unwrap();
    assert_eq!(alice.plain_text(), "");
    eventually("bob sees everything deleted", || bob.plain_text().is_empty()).await;

    bob.apply_local_edit(0, "after", 0).unwrap();
    eventually("alice sees bob's edit", || alice.plain_text() == "after").await;
    assert_eq!(alice.status().state, ConnectionState::Connected);

    let room = server.room_manager().get(&doc_id).await.unwrap();
    assert_eq!(room.backlog_len().await, 3, "each edit is one backlog entry");
}

#[tokio::test]
async fn test_offline_queue_past_soft_limit_replays_everything() {
    let server = start_test_server(None).await;
    let url = server.url();
    let doc_id = Uuid::new_v4();

    let tiny_queue = ClientConfig {
        offline_capacity: 2,
        ..fast_config(&url)
    };
    let mut alice = connected_with("Alice", doc_id, tiny_queue).await;
    let bob = connected("Bob", doc_id, &url).await;

    alice.shutdown().await;
    eventually("alice idle", || alice.connection_state() == ConnectionState::Idle).await;
    let notes: Vec<Uuid> = (0..6)
        .map(|i| alice.add_annotation(0, 0, "alice", format!("note {i}")).unwrap().id)
        .collect();

    alice.connect().await.unwrap();
    eventually("alice back", || alice.editing_enabled()).await;
    eventually("bob sees all offline notes", || {
        let seen = bob.resolve_annotations();
        notes.iter().all(|id| seen.iter().any(|r| r.id == *id))
    })
    .await;
}
