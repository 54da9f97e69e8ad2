//! # syncpad-relay — stateless fan-out for encrypted clipboard rooms
//!
//! The relay is an honest-but-curious broker: it subscribes each
//! WebSocket connection to the room named in its path and republishes
//! every frame to the room's other members, verbatim. Payloads are
//! end-to-end encrypted by the clients; the relay only ever inspects the
//! outer `type` tag, and only to answer liveness pings directly.
//!
//! ```text
//! ws://relay/<public-room-id>
//!                │
//!        ┌───────┴────────┐
//!        │  RoomRegistry  │  room id → broadcast group
//!        └───────┬────────┘
//!    ┌───────────┼───────────┐
//!    ▼           ▼           ▼
//! session A   session B   session C      (A's frame → B and C, never A)
//! ```
//!
//! Nothing is persisted and nothing is replayed: a frame in flight while
//! a member is disconnected is simply lost. Clients are built to recover
//! through their own sync handshake.

pub mod registry;

pub use registry::{RelayFrame, RoomRegistry};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

const PONG_FRAME: &str = r#"{"type":"pong","payload":null}"#;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Broadcast buffer per subscriber.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_owned(),
            broadcast_capacity: 256,
        }
    }
}

/// The relay server.
pub struct Relay {
    config: RelayConfig,
    registry: Arc<RoomRegistry>,
    next_conn_id: Arc<AtomicU64>,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
        Self {
            config,
            registry,
            next_conn_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// The registry backing this relay (exposed for tests and monitoring).
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Accept connections forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = self.registry.clone();
            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, conn_id, registry).await {
                    log::debug!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }
}

/// Room ids on the wire are public identifiers: 64 lowercase hex chars.
/// Anything else is rejected before the WebSocket upgrade completes.
pub fn is_valid_room_id(room_id: &str) -> bool {
    room_id.len() == 64
        && room_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    conn_id: u64,
    registry: Arc<RoomRegistry>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Capture and validate the room id during the handshake so that a bad
    // path is answered with a plain HTTP 400 instead of an upgrade.
    let mut room_id = String::new();
    let socket = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        let path = req.uri().path().trim_start_matches('/');
        if is_valid_room_id(path) {
            room_id = path.to_owned();
            Ok(resp)
        } else {
            log::warn!("rejecting {addr}: invalid room id {path:?}");
            let mut error = ErrorResponse::new(Some("invalid or missing room id".to_owned()));
            *error.status_mut() = StatusCode::BAD_REQUEST;
            Err(error)
        }
    })
    .await?;

    log::info!("connection {conn_id} from {addr} joined room {room_id}");
    let (publish, mut subscription) = registry.join(&room_id).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(raw))) => {
                        match frame_kind(raw.as_str()) {
                            // Liveness is answered directly, never broadcast.
                            Some(kind) if kind == "ping" => {
                                sink.send(Message::Text(PONG_FRAME.into())).await?;
                            }
                            Some(kind) if kind == "pong" => {}
                            // Everything else is forwarded untouched, even
                            // frames that fail to parse.
                            _ => {
                                let _ = publish.send((conn_id, Arc::new(raw.as_str().to_owned())));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        sink.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        log::debug!("socket error on connection {conn_id}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            relayed = subscription.recv() => {
                match relayed {
                    Ok((sender_id, raw)) => {
                        if sender_id == conn_id {
                            continue;
                        }
                        sink.send(Message::Text(raw.as_str().into())).await?;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("connection {conn_id} lagged by {n} frames");
                    }
                    Err(_) => break,
                }
            }
        }
    }

    registry.leave(&room_id).await;
    log::info!("connection {conn_id} left room {room_id}");
    Ok(())
}

/// Peek at a frame's outer `type` tag without touching the payload.
fn frame_kind(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    Some(value.get("type")?.as_str()?.to_owned())
}
