//! End-to-end tests for room synchronization over a real relay.
//!
//! These tests start a real relay and connect real sessions, exercising
//! the full pipeline: diff → encrypt → relay fan-out → dedup → decrypt
//! → merge.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;

use syncpad_relay::{Relay, RelayConfig};
use syncpad_sync::{
    public_room_id, RoomEvent, RoomSession, Session, SessionConfig, SessionStatus,
};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return the port.
async fn start_relay() -> u16 {
    let port = free_port().await;
    let relay = Relay::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    });
    tokio::spawn(async move {
        relay.run().await.unwrap();
    });
    // Give the relay time to bind
    sleep(Duration::from_millis(50)).await;
    port
}

fn relay_url(port: u16) -> String {
    format!("ws://127.0.0.1:{port}")
}

async fn wait_connected(room: &RoomSession) {
    timeout(Duration::from_secs(5), async {
        while room.status() != SessionStatus::Connected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never connected");
}

async fn wait_status(
    status: &mut tokio::sync::watch::Receiver<SessionStatus>,
    want: SessionStatus,
) {
    timeout(Duration::from_secs(5), async {
        while *status.borrow_and_update() != want {
            status.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {want:?}"));
}

/// Drain events until the given text arrives.
async fn wait_for_text(room: &mut RoomSession, want: &str) {
    timeout(Duration::from_secs(5), async {
        loop {
            match room.recv().await {
                Some(RoomEvent::TextChanged(text)) if text == want => break,
                Some(_) => {}
                None => panic!("room session ended early"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for text {want:?}"));
}

/// Assert that no text change or decrypt error arrives within `window`.
async fn assert_no_content_events(room: &mut RoomSession, window: Duration) {
    let outcome = timeout(window, async {
        loop {
            match room.recv().await {
                Some(RoomEvent::TextChanged(text)) => break format!("text {text:?}"),
                Some(RoomEvent::File(file)) => break format!("file {:?}", file.name),
                Some(RoomEvent::DecryptError) => break "decrypt error".to_owned(),
                Some(_) => {}
                None => break "channel closed".to_owned(),
            }
        }
    })
    .await;
    if let Ok(event) = outcome {
        panic!("unexpected content event: {event}");
    }
}

#[tokio::test]
async fn invalid_room_id_is_rejected_before_upgrade() {
    let port = start_relay().await;

    let err = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{port}/brave-coral-eagle-castle"
    ))
    .await;
    assert!(err.is_err(), "non-hashed room ids must be refused");

    let ok = tokio_tungstenite::connect_async(format!(
        "ws://127.0.0.1:{port}/{}",
        public_room_id("any-secret")
    ))
    .await;
    assert!(ok.is_ok(), "hashed room ids are accepted");
}

#[tokio::test]
async fn relay_answers_ping_directly() {
    let port = start_relay().await;
    let url = format!("ws://127.0.0.1:{port}/{}", public_room_id("ping-room"));
    let (mut socket, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    socket
        .send(Message::Text(r#"{"type":"ping","payload":null}"#.into()))
        .await
        .unwrap();

    let reply = timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("no pong within deadline")
        .unwrap()
        .unwrap();
    match reply {
        Message::Text(raw) => assert!(raw.as_str().contains(r#""type":"pong""#)),
        other => panic!("expected text pong, got {other:?}"),
    }
}

#[tokio::test]
async fn text_syncs_between_two_sessions() {
    let port = start_relay().await;
    let secret = "room-alpha";

    let alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    let mut bob = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.set_text("hello");
    wait_for_text(&mut bob, "hello").await;

    assert_eq!(bob.text(), "hello");
    assert!(bob.is_synced());
}

#[tokio::test]
async fn incremental_edits_converge() {
    let port = start_relay().await;
    let secret = "incremental-room";

    let mut alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    let mut bob = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    alice.set_text("hello");
    wait_for_text(&mut bob, "hello").await;

    // Keystroke-style contiguous edits from both sides.
    alice.set_text("hello world");
    wait_for_text(&mut bob, "hello world").await;
    bob.set_text("hello world!");
    wait_for_text(&mut alice, "hello world!").await;

    assert_eq!(alice.text(), bob.text());
}

#[tokio::test]
async fn late_joiner_receives_existing_document() {
    let port = start_relay().await;
    let secret = "late-join-room";

    let alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;
    alice.set_text("draft one");

    // Bob joins after the edit was broadcast; only the sync handshake can
    // get him the content.
    let mut bob = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_for_text(&mut bob, "draft one").await;
    assert!(bob.is_synced());
}

#[tokio::test]
async fn wrong_secret_is_isolated_from_the_room() {
    let port = start_relay().await;

    let alice = RoomSession::connect(&relay_url(port), "room-alpha").unwrap();
    let mut eve = RoomSession::connect(&relay_url(port), "room-omega").unwrap();
    wait_connected(&alice).await;
    wait_connected(&eve).await;

    // Different secrets hash to different routing keys entirely.
    assert_ne!(alice.public_id(), eve.public_id());

    alice.set_text("classified");
    assert_no_content_events(&mut eve, Duration::from_millis(400)).await;
    assert_eq!(eve.text(), "");
}

#[tokio::test]
async fn file_transfer_end_to_end() {
    let port = start_relay().await;
    let secret = "file-room";

    let alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    let mut bob = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    let bytes: Vec<u8> = (0u8..=255).collect();
    alice.send_file("blob.bin", "application/octet-stream", &bytes);

    let file = timeout(Duration::from_secs(5), async {
        loop {
            match bob.recv().await {
                Some(RoomEvent::File(file)) => break file,
                Some(_) => {}
                None => panic!("room session ended early"),
            }
        }
    })
    .await
    .expect("file never arrived");

    assert_eq!(file.name, "blob.bin");
    assert_eq!(file.mime, "application/octet-stream");
    assert_eq!(file.decoded_data().unwrap(), bytes);
}

#[tokio::test]
async fn relayed_echo_of_own_message_is_suppressed() {
    let port = start_relay().await;
    let secret = "echo-room";

    let mut alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;

    // A bare observer in the same room captures Alice's frames.
    let url = format!("ws://127.0.0.1:{port}/{}", public_room_id(secret));
    let (mut observer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    alice.set_text("hi");
    let frame = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Ok(Message::Text(raw))) = observer.next().await {
                if raw.as_str().contains(r#""type":"crdt""#) {
                    break raw.as_str().to_owned();
                }
            }
        }
    })
    .await
    .expect("observer never saw the update");

    // Reflect Alice's own frame back into the room.
    observer.send(Message::Text(frame.into())).await.unwrap();

    assert_no_content_events(&mut alice, Duration::from_millis(400)).await;
    assert_eq!(alice.text(), "hi");
}

#[tokio::test]
async fn replayed_frame_with_altered_payload_is_discarded() {
    let port = start_relay().await;
    let secret = "replay-room";

    let alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    let mut bob = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;
    wait_connected(&bob).await;

    let url = format!("ws://127.0.0.1:{port}/{}", public_room_id(secret));
    let (mut attacker, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    alice.set_text("hello");
    wait_for_text(&mut bob, "hello").await;

    let frame = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(Ok(Message::Text(raw))) = attacker.next().await {
                if raw.as_str().contains(r#""type":"crdt""#) {
                    break raw.as_str().to_owned();
                }
            }
        }
    })
    .await
    .expect("attacker never saw the update");

    // Re-send the captured id with a swapped payload. If the replay guard
    // failed, Bob would at least surface a decrypt error.
    let mut value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    value["payload"] = serde_json::Value::String("QUFBQQ==".to_owned());
    attacker
        .send(Message::Text(value.to_string().into()))
        .await
        .unwrap();

    assert_no_content_events(&mut bob, Duration::from_millis(400)).await;
    assert_eq!(bob.text(), "hello");
}

#[tokio::test]
async fn dead_connection_triggers_reconnect_and_recovers() {
    // A server that completes the handshake but never answers anything:
    // the connection looks open while being effectively dead.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(frame) = socket.next().await {
                    if frame.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let mut config = SessionConfig::new(format!("ws://127.0.0.1:{port}/dead"));
    config.ping_interval = Duration::from_millis(200);
    config.pong_timeout = Duration::from_millis(100);
    config.reconnect_base = Duration::from_millis(50);

    let handle = Session::spawn(config);
    let mut status = handle.status_stream();

    wait_status(&mut status, SessionStatus::Connected).await;
    // Missed pong forces the dead socket closed within one ping interval
    // plus the pong deadline.
    wait_status(&mut status, SessionStatus::Reconnecting).await;
    // The server still accepts connections, so the session comes back.
    wait_status(&mut status, SessionStatus::Connected).await;

    handle.close();
}

#[tokio::test]
async fn teardown_is_clean_and_final() {
    let port = start_relay().await;
    let secret = "teardown-room";

    let alice = RoomSession::connect(&relay_url(port), secret).unwrap();
    wait_connected(&alice).await;

    alice.close();
    timeout(Duration::from_secs(5), async {
        while alice.status() != SessionStatus::Disconnected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("session never tore down");

    // No reconnect after an intentional close.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.status(), SessionStatus::Disconnected);
}
