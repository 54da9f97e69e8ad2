//! Room session: ties the crypto envelope, transport session, and
//! scratchpad together behind one handle.
//!
//! Data flow:
//! ```text
//! set_text ──► Scratchpad (prefix/suffix diff) ──► update bytes
//!                                                     │ base64 + encrypt
//!                                                     ▼
//!                                          Session ──► relay ──► peers
//!
//! inbound frame ──► Session (dedup) ──► decrypt ──► crdt / sync / file
//! ```
//!
//! On every (re)connection the room sends a sync request carrying its
//! state vector, so a late joiner renders the room's current content
//! instead of a blank buffer. Requesting sync repeatedly is safe: applying
//! an already-known update is a no-op under CRDT semantics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::sync::{mpsc, watch};

use crate::crypto::{public_room_id, CryptoError, RoomKey};
use crate::protocol::{Envelope, FilePayload, MessageKind};
use crate::scratchpad::{Origin, Scratchpad};
use crate::session::{Session, SessionConfig, SessionHandle, SessionSender, SessionStatus};

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// Transport status changed.
    Status(SessionStatus),
    /// The merged text changed because of a remote update.
    TextChanged(String),
    /// A peer shared a file.
    File(FilePayload),
    /// An inbound message could not be decrypted; the sender may be using
    /// a different room secret. Non-fatal: later messages still process.
    DecryptError,
    /// Initial sync completed; the buffer now reflects the room.
    Synced,
}

/// A live, end-to-end-encrypted room session.
pub struct RoomSession {
    scratchpad: Arc<Scratchpad>,
    key: RoomKey,
    sender: SessionSender,
    // Held for its teardown-on-drop side effect.
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<RoomEvent>,
    synced: Arc<AtomicBool>,
    public_id: String,
}

impl RoomSession {
    /// Derive the room key from the secret and connect to the relay.
    ///
    /// A key-derivation failure means the session cannot encrypt or
    /// decrypt anything, so no connection is attempted at all.
    pub fn connect(relay_url: &str, secret: &str) -> Result<Self, CryptoError> {
        let key = RoomKey::derive(secret)?;
        let public_id = public_room_id(secret);
        let url = format!("{}/{}", relay_url.trim_end_matches('/'), public_id);
        Ok(Self::with_session(key, public_id, Session::spawn(SessionConfig::new(url))))
    }

    /// Like [`connect`], but with explicit transport timings.
    ///
    /// [`connect`]: RoomSession::connect
    pub fn connect_with(config: SessionConfig, secret: &str) -> Result<Self, CryptoError> {
        let key = RoomKey::derive(secret)?;
        let public_id = public_room_id(secret);
        let mut config = config;
        config.url = format!("{}/{}", config.url.trim_end_matches('/'), public_id);
        Ok(Self::with_session(key, public_id, Session::spawn(config)))
    }

    fn with_session(key: RoomKey, public_id: String, mut session: SessionHandle) -> Self {
        let scratchpad = Arc::new(Scratchpad::new());
        let synced = Arc::new(AtomicBool::new(false));
        let (event_tx, events) = mpsc::unbounded_channel();

        if let Some(session_events) = session.take_events() {
            tokio::spawn(room_task(
                scratchpad.clone(),
                key.clone(),
                session.sender(),
                session_events,
                session.status_stream(),
                synced.clone(),
                event_tx,
            ));
        } else {
            log::error!("session events already taken; room will not receive updates");
        }

        Self {
            scratchpad,
            key,
            sender: session.sender(),
            session,
            events,
            synced,
            public_id,
        }
    }

    /// Replace the local buffer with an edited version.
    ///
    /// The changed span becomes one CRDT update, encrypted and broadcast
    /// as a single message.
    pub fn set_text(&self, new_text: &str) {
        if let Some(update) = self.scratchpad.apply_local_edit(new_text) {
            self.send_binary(Envelope::crdt, &update);
        }
    }

    /// Share a file with the room. The whole file travels as one message.
    pub fn send_file(&self, name: &str, mime: &str, bytes: &[u8]) {
        let payload = FilePayload::from_bytes(name, mime, bytes);
        match payload.to_json() {
            Ok(json) => match self.key.encrypt(&json) {
                Ok(ciphertext) => self.sender.send(Envelope::file(ciphertext)),
                Err(e) => log::error!("could not encrypt file payload: {e}"),
            },
            Err(e) => log::error!("could not serialize file payload: {e}"),
        }
    }

    /// Receive the next room event.
    pub async fn recv(&mut self) -> Option<RoomEvent> {
        self.events.recv().await
    }

    /// Current merged text.
    pub fn text(&self) -> String {
        self.scratchpad.text()
    }

    /// Whether the initial sync handshake has completed on this connection.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Current transport status.
    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// The relay routing key for this room (never the secret).
    pub fn public_id(&self) -> &str {
        &self.public_id
    }

    /// Tear the session down. Also happens automatically on drop.
    pub fn close(&self) {
        self.session.close();
    }

    /// Binary payloads cross the crypto envelope as Base64 text.
    fn send_binary(&self, make: fn(String) -> Envelope, bytes: &[u8]) {
        match self.key.encrypt(B64.encode(bytes).as_bytes()) {
            Ok(ciphertext) => self.sender.send(make(ciphertext)),
            Err(e) => log::error!("could not encrypt outbound message: {e}"),
        }
    }
}

async fn room_task(
    scratchpad: Arc<Scratchpad>,
    key: RoomKey,
    sender: SessionSender,
    mut session_events: mpsc::UnboundedReceiver<Envelope>,
    mut status_rx: watch::Receiver<SessionStatus>,
    synced: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<RoomEvent>,
) {
    // The transport may have connected before this task started watching.
    if *status_rx.borrow_and_update() == SessionStatus::Connected {
        request_sync(&scratchpad, &key, &sender);
    }

    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = *status_rx.borrow_and_update();
                if event_tx.send(RoomEvent::Status(status)).is_err() {
                    break;
                }
                match status {
                    SessionStatus::Connected => {
                        if !synced.load(Ordering::Relaxed) {
                            request_sync(&scratchpad, &key, &sender);
                        }
                    }
                    // A new connection starts stale until resynced.
                    SessionStatus::Reconnecting | SessionStatus::Disconnected => {
                        synced.store(false, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }

            envelope = session_events.recv() => {
                let Some(envelope) = envelope else { break };
                if handle_envelope(&scratchpad, &key, &sender, &synced, &event_tx, envelope)
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}

fn request_sync(scratchpad: &Scratchpad, key: &RoomKey, sender: &SessionSender) {
    let state_vector = scratchpad.state_vector();
    match key.encrypt(B64.encode(state_vector).as_bytes()) {
        Ok(ciphertext) => sender.send(Envelope::sync_request(ciphertext)),
        Err(e) => log::error!("could not encrypt sync request: {e}"),
    }
}

/// Consumer-side result: `Err` only when the event channel is gone.
type Dispatch = Result<(), ()>;

fn handle_envelope(
    scratchpad: &Scratchpad,
    key: &RoomKey,
    sender: &SessionSender,
    synced: &AtomicBool,
    event_tx: &mpsc::UnboundedSender<RoomEvent>,
    envelope: Envelope,
) -> Dispatch {
    let emit = |event: RoomEvent| event_tx.send(event).map_err(|_| ());

    match envelope.kind {
        MessageKind::Crdt | MessageKind::SyncResponse => {
            let Some(update) = open_binary_payload(key, &envelope, event_tx)? else {
                return Ok(());
            };
            match scratchpad.apply_update(&update, Origin::Remote) {
                Ok(()) => {
                    if !synced.swap(true, Ordering::Relaxed) {
                        emit(RoomEvent::Synced)?;
                    }
                    emit(RoomEvent::TextChanged(scratchpad.text()))?;
                }
                // Fatal to this message only; the document is untouched.
                Err(e) => log::warn!("discarding bad update: {e}"),
            }
        }

        MessageKind::SyncRequest => {
            let Some(state_vector) = open_binary_payload(key, &envelope, event_tx)? else {
                return Ok(());
            };
            match scratchpad.diff(&state_vector) {
                Ok(missing) => match key.encrypt(B64.encode(missing).as_bytes()) {
                    Ok(ciphertext) => sender.send(Envelope::sync_response(ciphertext)),
                    Err(e) => log::error!("could not encrypt sync response: {e}"),
                },
                Err(e) => log::warn!("discarding sync request with bad state vector: {e}"),
            }
        }

        MessageKind::File => {
            let Some(payload) = envelope.payload.as_deref() else {
                log::warn!("file message without payload");
                return Ok(());
            };
            match key.decrypt(payload) {
                Ok(plain) => match FilePayload::from_json(&plain) {
                    Ok(file) => emit(RoomEvent::File(file))?,
                    Err(e) => log::warn!("discarding file message: {e}"),
                },
                Err(_) => emit(RoomEvent::DecryptError)?,
            }
        }

        // Whole-buffer text broadcasts predate CRDT sync; this engine
        // speaks only the CRDT strategy.
        MessageKind::Text => {
            log::debug!("ignoring legacy whole-buffer text message");
        }

        // Liveness never reaches this layer; the session answers it.
        MessageKind::Ping | MessageKind::Pong => {}
    }

    Ok(())
}

/// Decrypt and Base64-decode a binary payload (CRDT update or state
/// vector). `Ok(None)` means the message was dropped and, when relevant,
/// the decrypt failure was surfaced.
fn open_binary_payload(
    key: &RoomKey,
    envelope: &Envelope,
    event_tx: &mpsc::UnboundedSender<RoomEvent>,
) -> Result<Option<Vec<u8>>, ()> {
    let Some(payload) = envelope.payload.as_deref() else {
        log::warn!("{:?} message without payload", envelope.kind);
        return Ok(None);
    };
    let plain = match key.decrypt(payload) {
        Ok(plain) => plain,
        Err(_) => {
            event_tx.send(RoomEvent::DecryptError).map_err(|_| ())?;
            return Ok(None);
        }
    };
    match B64.decode(&plain) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) => {
            log::warn!("discarding {:?} message with bad encoding: {e}", envelope.kind);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (
        mpsc::UnboundedSender<RoomEvent>,
        mpsc::UnboundedReceiver<RoomEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    fn dummy_sender() -> (SessionSender, SessionHandle) {
        let handle = Session::spawn(SessionConfig::new("ws://127.0.0.1:1/unused"));
        (handle.sender(), handle)
    }

    fn sealed_update(key: &RoomKey, update: &[u8]) -> String {
        key.encrypt(B64.encode(update).as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn crdt_message_applies_and_marks_synced() {
        let key = RoomKey::derive("room").unwrap();
        let pad = Scratchpad::new();
        let synced = AtomicBool::new(false);
        let (event_tx, mut events) = channel();
        let (sender, _handle) = dummy_sender();

        let remote = Scratchpad::new();
        let update = remote.apply_local_edit("hello").unwrap();
        let envelope = Envelope::crdt(sealed_update(&key, &update));

        handle_envelope(&pad, &key, &sender, &synced, &event_tx, envelope).unwrap();

        assert_eq!(pad.text(), "hello");
        assert!(synced.load(Ordering::Relaxed));
        assert_eq!(events.recv().await, Some(RoomEvent::Synced));
        assert_eq!(events.recv().await, Some(RoomEvent::TextChanged("hello".into())));
    }

    #[tokio::test]
    async fn wrong_key_surfaces_decrypt_error_and_continues() {
        let key = RoomKey::derive("room").unwrap();
        let other = RoomKey::derive("different-room").unwrap();
        let pad = Scratchpad::new();
        let synced = AtomicBool::new(false);
        let (event_tx, mut events) = channel();
        let (sender, _handle) = dummy_sender();

        let remote = Scratchpad::new();
        let update = remote.apply_local_edit("stranger").unwrap();
        let foreign = Envelope::crdt(sealed_update(&other, &update));
        handle_envelope(&pad, &key, &sender, &synced, &event_tx, foreign).unwrap();

        assert_eq!(events.recv().await, Some(RoomEvent::DecryptError));
        assert_eq!(pad.text(), "");
        assert!(!synced.load(Ordering::Relaxed));

        // A well-formed message right after still processes.
        let update = remote.apply_local_edit("stranger!").unwrap();
        let ours = Envelope::crdt(sealed_update(&key, &update));
        handle_envelope(&pad, &key, &sender, &synced, &event_tx, ours).unwrap();
        assert_eq!(events.recv().await, Some(RoomEvent::Synced));
    }

    #[tokio::test]
    async fn corrupt_update_is_fatal_to_that_message_only() {
        let key = RoomKey::derive("room").unwrap();
        let pad = Scratchpad::new();
        pad.apply_local_edit("intact").unwrap();
        let synced = AtomicBool::new(true);
        let (event_tx, mut events) = channel();
        let (sender, _handle) = dummy_sender();

        let envelope = Envelope::crdt(sealed_update(&key, &[0xFF, 0xFE, 0x00]));
        handle_envelope(&pad, &key, &sender, &synced, &event_tx, envelope).unwrap();

        assert_eq!(pad.text(), "intact");
        assert!(events.try_recv().is_err(), "bad update emits no event");
    }

    #[tokio::test]
    async fn file_message_surfaces_payload() {
        let key = RoomKey::derive("room").unwrap();
        let pad = Scratchpad::new();
        let synced = AtomicBool::new(true);
        let (event_tx, mut events) = channel();
        let (sender, _handle) = dummy_sender();

        let file = FilePayload::from_bytes("notes.txt", "text/plain", b"contents");
        let ciphertext = key.encrypt(&file.to_json().unwrap()).unwrap();
        handle_envelope(&pad, &key, &sender, &synced, &event_tx, Envelope::file(ciphertext))
            .unwrap();

        assert_eq!(events.recv().await, Some(RoomEvent::File(file)));
    }

    #[tokio::test]
    async fn legacy_text_message_is_ignored() {
        let key = RoomKey::derive("room").unwrap();
        let pad = Scratchpad::new();
        let synced = AtomicBool::new(false);
        let (event_tx, mut events) = channel();
        let (sender, _handle) = dummy_sender();

        let ciphertext = key.encrypt(b"whole buffer").unwrap();
        handle_envelope(&pad, &key, &sender, &synced, &event_tx, Envelope::text(ciphertext))
            .unwrap();

        assert_eq!(pad.text(), "");
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn connect_derives_key_and_routing_id() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let room = RoomSession::connect("ws://127.0.0.1:1", "secret").unwrap();
        assert_eq!(room.public_id(), public_room_id("secret"));
        assert_eq!(room.text(), "");
        assert!(!room.is_synced());
        room.close();
    }
}
