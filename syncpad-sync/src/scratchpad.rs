//! Replicated text buffer backed by a Yrs document.
//!
//! One room synchronizes exactly one logical text field, stored under a
//! fixed root name. Local keystrokes become minimal delete+insert
//! operations; remote updates merge commutatively and idempotently, so
//! arrival order and duplication never change the converged text.

use std::sync::Mutex;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

/// Root name of the shared text field.
const SCRATCHPAD_FIELD: &str = "scratchpad";

/// Who produced a document mutation.
///
/// Remote updates must never re-trigger outbound propagation; threading
/// the origin through every mutation entry point (rather than an ambient
/// flag) is what breaks that feedback loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    fn as_yrs(self) -> yrs::Origin {
        match self {
            Self::Local => yrs::Origin::from("local"),
            Self::Remote => yrs::Origin::from("remote"),
        }
    }
}

/// Scratchpad errors. Corrupt update bytes are fatal to that update only;
/// the document itself is never rolled back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScratchpadError {
    /// Update or state-vector bytes failed to decode.
    Decode(String),
    /// A decoded update could not be integrated.
    Apply(String),
}

impl std::fmt::Display for ScratchpadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "could not decode update: {e}"),
            Self::Apply(e) => write!(f, "could not apply update: {e}"),
        }
    }
}

impl std::error::Error for ScratchpadError {}

/// The replicated text buffer.
///
/// All operations are serialized through an internal lock, so document
/// transactions never race between the caller's thread and the session
/// task applying remote updates.
pub struct Scratchpad {
    doc: Mutex<Doc>,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self {
            doc: Mutex::new(Doc::new()),
        }
    }

    /// Current merged text.
    pub fn text(&self) -> String {
        let doc = self.doc.lock().unwrap();
        let text = doc.get_or_insert_text(SCRATCHPAD_FIELD);
        let txn = doc.transact();
        text.get_string(&txn)
    }

    /// Apply an edited full buffer as a local change.
    ///
    /// Textarea edits are contiguous, so a common-prefix/common-suffix trim
    /// is enough to find the changed span; only that span is deleted and
    /// re-inserted. Returns the encoded update for exactly this transaction
    /// (to be encrypted and broadcast), or `None` if nothing changed.
    pub fn apply_local_edit(&self, new_text: &str) -> Option<Vec<u8>> {
        let doc = self.doc.lock().unwrap();
        let text = doc.get_or_insert_text(SCRATCHPAD_FIELD);
        let old_text = {
            let txn = doc.transact();
            text.get_string(&txn)
        };

        let (start, old_end, new_end) = diff_bounds(&old_text, new_text)?;

        let mut txn = doc.transact_mut_with(Origin::Local.as_yrs());
        if old_end > start {
            text.remove_range(&mut txn, start as u32, (old_end - start) as u32);
        }
        if new_end > start {
            text.insert(&mut txn, start as u32, &new_text[start..new_end]);
        }
        Some(txn.encode_update_v1())
    }

    /// Apply an encoded update under the given origin.
    pub fn apply_update(&self, update: &[u8], origin: Origin) -> Result<(), ScratchpadError> {
        let update =
            Update::decode_v1(update).map_err(|e| ScratchpadError::Decode(e.to_string()))?;
        let doc = self.doc.lock().unwrap();
        let mut txn = doc.transact_mut_with(origin.as_yrs());
        txn.apply_update(update)
            .map_err(|e| ScratchpadError::Apply(e.to_string()))?;
        Ok(())
    }

    /// Encoded state vector: a compact summary of which operations this
    /// replica already has.
    pub fn state_vector(&self) -> Vec<u8> {
        let doc = self.doc.lock().unwrap();
        let txn = doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Minimal update containing every operation a peer with the given
    /// state vector is missing.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ScratchpadError> {
        let remote_sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ScratchpadError::Decode(e.to_string()))?;
        let doc = self.doc.lock().unwrap();
        let txn = doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }
}

impl Default for Scratchpad {
    fn default() -> Self {
        Self::new()
    }
}

/// Common-prefix/common-suffix trim between two buffers.
///
/// Returns `(start, old_end, new_end)` as byte offsets aligned to char
/// boundaries: the old span `start..old_end` is replaced by the new span
/// `start..new_end`. `None` when the buffers are equal.
fn diff_bounds(old: &str, new: &str) -> Option<(usize, usize, usize)> {
    if old == new {
        return None;
    }

    let mut start = 0;
    let mut old_chars = old.chars();
    let mut new_chars = new.chars();
    while let (Some(a), Some(b)) = (old_chars.next(), new_chars.next()) {
        if a != b {
            break;
        }
        start += a.len_utf8();
    }

    let mut old_end = old.len();
    let mut new_end = new.len();
    let mut old_rev = old.chars().rev();
    let mut new_rev = new.chars().rev();
    while old_end > start && new_end > start {
        match (old_rev.next(), new_rev.next()) {
            (Some(a), Some(b)) if a == b => {
                old_end -= a.len_utf8();
                new_end -= b.len_utf8();
            }
            _ => break,
        }
    }

    Some((start, old_end, new_end))
}
