//! # syncpad-sync — client-side engine for a zero-storage shared clipboard
//!
//! Devices that know the same room secret see one shared text buffer and
//! can pass files to each other in real time. Nothing is ever stored:
//! state lives only in the connected sessions, and the relay in between
//! forwards opaque ciphertext it cannot read.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   encrypted JSON    ┌──────────────┐
//! │ RoomSession  │ ◄──────────────────► │    relay     │ ◄──► other rooms'
//! │ (per device) │   over WebSocket     │ (pub/sub)    │       sessions
//! └──────┬───────┘                      └──────────────┘
//!        │
//!        ├── Scratchpad  — Yrs text CRDT, converges under any delivery order
//!        ├── RoomKey     — PBKDF2-derived AES-256-GCM envelope
//!        └── Session     — socket lifecycle, heartbeat, backoff, dedup
//! ```
//!
//! ## Modules
//!
//! - [`crypto`] — key derivation, AEAD envelope, public room identifier
//! - [`protocol`] — JSON wire envelope and file payloads
//! - [`scratchpad`] — replicated text buffer (Yrs)
//! - [`session`] — WebSocket transport with reconnect and replay defense
//! - [`room`] — the composed session an application embeds

pub mod crypto;
pub mod protocol;
pub mod room;
pub mod scratchpad;
pub mod session;

// Re-exports for convenience
pub use crypto::{public_room_id, CryptoError, RoomKey};
pub use protocol::{Envelope, FilePayload, MessageKind, ProtocolError};
pub use room::{RoomEvent, RoomSession};
pub use scratchpad::{Origin, Scratchpad, ScratchpadError};
pub use session::{Session, SessionConfig, SessionHandle, SessionSender, SessionStatus};
