//! WebSocket transport session: socket lifecycle, liveness probing,
//! reconnection, and message dedup.
//!
//! One tokio task owns the whole lifecycle:
//!
//! ```text
//! Connecting ──► Connected ──► (socket close / dead ping) ──► Reconnecting
//!                    ▲                                             │
//!                    └──────────── backoff: min(1s·2ⁿ, 30s) ───────┘
//!
//! close() / handle drop ──► Disconnected (terminal)
//! ```
//!
//! Reconnection attempts are unbounded while the handle lives. Sending is
//! at-most-once: messages submitted while not connected are dropped with a
//! logged error, never queued.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::protocol::Envelope;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY_BASE: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// Cap on each recent-id set; exceeding it evicts the oldest half.
const MAX_TRACKED_IDS: usize = 100;

/// Observable connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
    Error,
}

/// Transport session configuration. The liveness and backoff knobs exist
/// mainly so tests can compress the timings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full WebSocket URL, including the room path.
    pub url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
            reconnect_base: RECONNECT_DELAY_BASE,
            reconnect_max: MAX_RECONNECT_DELAY,
        }
    }
}

/// Bounded insertion-ordered id set. When the cap is exceeded the oldest
/// half is evicted, keeping the most recent ids for dedup.
struct RecentIds {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl RecentIds {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Record an id. Returns `false` if it was already present.
    fn insert(&mut self, id: String) -> bool {
        if !self.seen.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        if self.seen.len() > self.cap {
            let keep = self.cap / 2;
            while self.order.len() > keep {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        true
    }

    fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Cloneable sending half of a session.
#[derive(Clone)]
pub struct SessionSender {
    outgoing: mpsc::UnboundedSender<Envelope>,
    status: watch::Receiver<SessionStatus>,
    sent_ids: Arc<Mutex<RecentIds>>,
}

impl SessionSender {
    /// Send a message, fire-and-forget.
    ///
    /// No-ops with a logged error unless the socket is currently open.
    /// Content messages get a fresh unique id, tracked so the session can
    /// discard its own echo if the relay reflects it back.
    pub fn send(&self, mut envelope: Envelope) {
        if *self.status.borrow() != SessionStatus::Connected {
            log::error!(
                "dropping outbound {:?} message: session is not connected",
                envelope.kind
            );
            return;
        }
        if !envelope.kind.is_liveness() {
            let id = Uuid::new_v4().to_string();
            self.sent_ids.lock().unwrap().insert(id.clone());
            envelope.message_id = Some(id);
        }
        if self.outgoing.send(envelope).is_err() {
            log::error!("session task has stopped; dropping outbound message");
        }
    }
}

/// Handle to a running session. Dropping it (or calling [`close`]) sets the
/// do-not-reconnect flag and tears the connection down; teardown runs
/// exactly once regardless of which exit path triggers it.
///
/// [`close`]: SessionHandle::close
pub struct SessionHandle {
    sender: SessionSender,
    events: Option<mpsc::UnboundedReceiver<Envelope>>,
    shutdown: watch::Sender<bool>,
}

impl SessionHandle {
    /// Cloneable sending half.
    pub fn sender(&self) -> SessionSender {
        self.sender.clone()
    }

    /// Send a message through the session (see [`SessionSender::send`]).
    pub fn send(&self, envelope: Envelope) {
        self.sender.send(envelope);
    }

    /// Take the inbound content-message receiver. Can only be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        self.events.take()
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        *self.sender.status.borrow()
    }

    /// Watch stream of status transitions.
    pub fn status_stream(&self) -> watch::Receiver<SessionStatus> {
        self.sender.status.clone()
    }

    /// Stop reconnecting and close the socket.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// The transport session.
pub struct Session;

impl Session {
    /// Spawn the session task and return its handle.
    pub fn spawn(config: SessionConfig) -> SessionHandle {
        let (status_tx, status_rx) = watch::channel(SessionStatus::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sent_ids = Arc::new(Mutex::new(RecentIds::new(MAX_TRACKED_IDS)));

        tokio::spawn(run_session(
            config,
            status_tx,
            event_tx,
            outgoing_rx,
            shutdown_rx,
            sent_ids.clone(),
        ));

        SessionHandle {
            sender: SessionSender {
                outgoing: outgoing_tx,
                status: status_rx,
                sent_ids,
            },
            events: Some(event_rx),
            shutdown: shutdown_tx,
        }
    }
}

/// Delay before reconnect attempt `attempt`: exponential with a ceiling.
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt)).min(max)
}

enum Outcome {
    /// Socket closed or died; reconnect unless shutting down.
    Closed,
    /// Intentional teardown; do not reconnect.
    Shutdown,
}

async fn run_session(
    config: SessionConfig,
    status_tx: watch::Sender<SessionStatus>,
    event_tx: mpsc::UnboundedSender<Envelope>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Envelope>,
    mut shutdown_rx: watch::Receiver<bool>,
    sent_ids: Arc<Mutex<RecentIds>>,
) {
    let received_ids = Arc::new(Mutex::new(RecentIds::new(MAX_TRACKED_IDS)));
    let mut attempt: u32 = 0;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let _ = status_tx.send(if attempt == 0 {
            SessionStatus::Connecting
        } else {
            SessionStatus::Reconnecting
        });
        log::debug!("connecting to {} (attempt {})", config.url, attempt + 1);

        match tokio_tungstenite::connect_async(&config.url).await {
            Ok((socket, _)) => {
                attempt = 0;
                let _ = status_tx.send(SessionStatus::Connected);
                log::info!("connected to {}", config.url);

                let outcome = drive(
                    socket,
                    &config,
                    &status_tx,
                    &event_tx,
                    &mut outgoing_rx,
                    &mut shutdown_rx,
                    &sent_ids,
                    &received_ids,
                )
                .await;

                if matches!(outcome, Outcome::Shutdown) {
                    break;
                }
            }
            Err(e) => {
                log::warn!("connection to {} failed: {e}", config.url);
                let _ = status_tx.send(SessionStatus::Error);
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }

        let delay = backoff_delay(config.reconnect_base, config.reconnect_max, attempt);
        attempt += 1;
        let _ = status_tx.send(SessionStatus::Reconnecting);
        log::info!("reconnecting in {delay:?}");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    let _ = status_tx.send(SessionStatus::Disconnected);
    log::debug!("session for {} torn down", config.url);
}

/// Drive one live connection until it closes or the session shuts down.
#[allow(clippy::too_many_arguments)]
async fn drive(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    config: &SessionConfig,
    status_tx: &watch::Sender<SessionStatus>,
    event_tx: &mpsc::UnboundedSender<Envelope>,
    outgoing_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    shutdown_rx: &mut watch::Receiver<bool>,
    sent_ids: &Arc<Mutex<RecentIds>>,
    received_ids: &Arc<Mutex<RecentIds>>,
) -> Outcome {
    let (mut sink, mut stream) = socket.split();

    // Delivery is at-most-once: anything submitted in the race window while
    // the socket was down is discarded, not delivered late.
    while outgoing_rx.try_recv().is_ok() {}

    // First tick one interval from now, not immediately.
    let mut ping_timer = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Armed whenever a ping is in flight; a missed deadline means the
    // connection is silently dead and must be force-closed.
    let mut pong_deadline = Box::pin(tokio::time::sleep(config.pong_timeout));
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return Outcome::Shutdown;
                }
            }

            _ = ping_timer.tick() => {
                match Envelope::ping().encode() {
                    Ok(frame) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            return Outcome::Closed;
                        }
                        pong_deadline.as_mut().reset(Instant::now() + config.pong_timeout);
                        awaiting_pong = true;
                    }
                    Err(e) => log::error!("could not encode ping: {e}"),
                }
            }

            _ = pong_deadline.as_mut(), if awaiting_pong => {
                log::warn!("no pong within {:?}; closing dead connection", config.pong_timeout);
                let _ = sink.send(Message::Close(None)).await;
                return Outcome::Closed;
            }

            outbound = outgoing_rx.recv() => {
                let Some(envelope) = outbound else {
                    // Every handle and sender is gone; tear down.
                    let _ = sink.send(Message::Close(None)).await;
                    return Outcome::Shutdown;
                };
                match envelope.encode() {
                    Ok(frame) => {
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            log::warn!("send failed; connection lost");
                            return Outcome::Closed;
                        }
                    }
                    Err(e) => log::error!("could not encode outbound message: {e}"),
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(raw))) => {
                        if let Some(reply) = handle_frame(
                            raw.as_str(),
                            event_tx,
                            &mut awaiting_pong,
                            sent_ids,
                            received_ids,
                        ) {
                            match reply.encode() {
                                Ok(encoded) => {
                                    if sink.send(Message::Text(encoded.into())).await.is_err() {
                                        return Outcome::Closed;
                                    }
                                }
                                Err(e) => log::error!("could not encode reply: {e}"),
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("connection closed by peer");
                        return Outcome::Closed;
                    }
                    Some(Err(e)) => {
                        log::error!("socket error: {e}");
                        let _ = status_tx.send(SessionStatus::Error);
                        return Outcome::Closed;
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Process one inbound text frame. Returns a reply envelope when the frame
/// demands one (ping → pong).
fn handle_frame(
    raw: &str,
    event_tx: &mpsc::UnboundedSender<Envelope>,
    awaiting_pong: &mut bool,
    sent_ids: &Arc<Mutex<RecentIds>>,
    received_ids: &Arc<Mutex<RecentIds>>,
) -> Option<Envelope> {
    let envelope = match Envelope::decode(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("dropping frame: {e}");
            return None;
        }
    };

    if envelope.kind == crate::protocol::MessageKind::Ping {
        return Some(Envelope::pong());
    }
    if envelope.kind == crate::protocol::MessageKind::Pong {
        *awaiting_pong = false;
        return None;
    }

    if let Some(id) = envelope.message_id.as_deref() {
        if sent_ids.lock().unwrap().contains(id) {
            // The relay reflected our own publish back to us.
            log::debug!("suppressing self-echo of message {id}");
            return None;
        }
        if !received_ids.lock().unwrap().insert(id.to_owned()) {
            log::warn!("replayed message id {id}; discarding");
            return None;
        }
    }

    if event_tx.send(envelope).is_err() {
        log::debug!("no consumer for inbound messages; dropping");
    }
    None
}
