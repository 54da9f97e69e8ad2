//! JSON wire protocol for room traffic.
//!
//! Wire format (JSON over a WebSocket text frame):
//! ```text
//! { "type": "crdt", "payload": "<base64 ciphertext>", "messageId": "<uuid>" }
//! { "type": "ping", "payload": null }
//! ```
//!
//! `payload` is opaque to the relay: for content messages it is always an
//! encrypted, Base64-encoded blob; liveness messages carry `null`.
//! `messageId` is assigned by the transport session and omitted for
//! ping/pong, which are excluded from dedup tracking.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Message kinds. This set is closed: frames carrying any other tag are
/// rejected at decode time with [`ProtocolError::UnknownKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Legacy whole-buffer text broadcast, superseded by `Crdt`.
    Text,
    /// Single-message file transfer.
    File,
    /// Incremental CRDT update.
    Crdt,
    /// State-vector exchange: "what do I already have".
    SyncRequest,
    /// Missing-operations reply to a sync request.
    SyncResponse,
    /// Heartbeat probe.
    Ping,
    /// Heartbeat reply.
    Pong,
}

impl MessageKind {
    /// Liveness messages carry no payload and no message id.
    pub fn is_liveness(&self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

/// Top-level wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Option<String>,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    fn content(kind: MessageKind, ciphertext: String) -> Self {
        Self {
            kind,
            payload: Some(ciphertext),
            message_id: None,
        }
    }

    /// A legacy whole-buffer text message.
    pub fn text(ciphertext: String) -> Self {
        Self::content(MessageKind::Text, ciphertext)
    }

    /// A file-transfer message.
    pub fn file(ciphertext: String) -> Self {
        Self::content(MessageKind::File, ciphertext)
    }

    /// An incremental CRDT update.
    pub fn crdt(ciphertext: String) -> Self {
        Self::content(MessageKind::Crdt, ciphertext)
    }

    /// A sync request carrying the local state vector.
    pub fn sync_request(ciphertext: String) -> Self {
        Self::content(MessageKind::SyncRequest, ciphertext)
    }

    /// A sync response carrying the operations the requester is missing.
    pub fn sync_response(ciphertext: String) -> Self {
        Self::content(MessageKind::SyncResponse, ciphertext)
    }

    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            payload: None,
            message_id: None,
        }
    }

    pub fn pong() -> Self {
        Self {
            kind: MessageKind::Pong,
            payload: None,
            message_id: None,
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    ///
    /// Decoding is two-step so that a structurally valid frame with an
    /// unrecognized `type` tag surfaces as [`ProtocolError::UnknownKind`]
    /// rather than a generic parse failure.
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or(ProtocolError::MissingKind)?;
        if serde_json::from_value::<MessageKind>(serde_json::Value::String(tag.to_owned())).is_err()
        {
            return Err(ProtocolError::UnknownKind(tag.to_owned()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Decrypted payload of a `file` message. The whole file travels as one
/// message; size is bounded only by the transport frame limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilePayload {
    pub name: String,
    /// MIME type.
    #[serde(rename = "type")]
    pub mime: String,
    /// Data-URL-style Base64 (`data:<mime>;base64,<data>`).
    pub data: String,
}

impl FilePayload {
    pub fn from_bytes(name: impl Into<String>, mime: impl Into<String>, bytes: &[u8]) -> Self {
        let mime = mime.into();
        let data = format!("data:{mime};base64,{}", B64.encode(bytes));
        Self {
            name: name.into(),
            mime,
            data,
        }
    }

    /// Recover the raw file bytes from the data-URL payload.
    pub fn decoded_data(&self) -> Result<Vec<u8>, ProtocolError> {
        // Tolerate a bare Base64 string with no data-URL header.
        let b64 = match self.data.split_once(',') {
            Some((_, rest)) => rest,
            None => self.data.as_str(),
        };
        B64.decode(b64)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame is not valid JSON or does not match the envelope shape.
    Malformed(String),
    /// Frame has no `type` field.
    MissingKind,
    /// Frame carries a tag outside the closed message-kind set.
    UnknownKind(String),
    /// Decrypted payload does not match the expected shape for its kind.
    InvalidPayload(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed frame: {e}"),
            Self::MissingKind => write!(f, "frame has no message type"),
            Self::UnknownKind(tag) => write!(f, "unrecognized message type {tag:?}"),
            Self::InvalidPayload(e) => write!(f, "invalid payload: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
