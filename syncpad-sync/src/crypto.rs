//! End-to-end encryption for room traffic.
//!
//! Every participant derives the same AES-256 key from the shared room
//! secret, so no key material ever crosses the wire. The relay only sees
//! the public room identifier (a one-way hash of the secret) and opaque
//! Base64 ciphertext.
//!
//! Wire shape of an encrypted payload: `base64(nonce || ciphertext)`,
//! with a fresh random 12-byte nonce per message.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use hmac::Hmac;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// AES-GCM standard non-secret nonce length.
const NONCE_LEN: usize = 12;

/// Constant prefix ensuring the derived salt is unique to this application.
const SALT_PREFIX: &str = "syncpad-salt-";

/// Separate domain prefix for the relay routing identifier, so the public
/// room id can never collide with the key-derivation salt.
const ROOM_ID_PREFIX: &str = "syncpad-room-";

/// PBKDF2-HMAC-SHA256 iteration count. Intentionally expensive: the cost
/// is the brute-force deterrent for guessed room secrets.
const PBKDF2_ITERATIONS: u32 = 100_000;

type HmacSha256 = Hmac<Sha256>;

/// Crypto errors.
///
/// Decryption failures are deliberately collapsed into a single generic
/// variant: the message shown to users must not reveal whether the Base64,
/// the nonce, or the authentication tag was at fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    KeyDerivation,
    Encrypt,
    Decrypt,
}

impl std::fmt::Display for CryptoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyDerivation => write!(f, "key derivation failed"),
            Self::Encrypt => write!(f, "could not encrypt message"),
            Self::Decrypt => {
                write!(
                    f,
                    "could not decrypt message; the sender may be using a different room secret"
                )
            }
        }
    }
}

impl std::error::Error for CryptoError {}

/// The symmetric room key, derived once per session and held only in memory.
#[derive(Clone)]
pub struct RoomKey {
    cipher: Aes256Gcm,
}

impl RoomKey {
    /// Derive the room key from the shared secret.
    ///
    /// PBKDF2-HMAC-SHA256 over the secret, with a per-room salt computed as
    /// `SHA-256(SALT_PREFIX || secret)`. The salt never needs to be
    /// transmitted: every device with the secret derives the same one.
    pub fn derive(secret: &str) -> Result<Self, CryptoError> {
        let salt = Sha256::digest(format!("{SALT_PREFIX}{secret}"));
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(secret.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key)
            .map_err(|_| CryptoError::KeyDerivation)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::KeyDerivation)?;
        Ok(Self { cipher })
    }

    /// Encrypt a payload, returning `base64(nonce || ciphertext)`.
    ///
    /// A unique nonce is generated for every call; reuse would break
    /// confidentiality.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(B64.encode(combined))
    }

    /// Decrypt a `base64(nonce || ciphertext)` payload.
    ///
    /// Fails with [`CryptoError::Decrypt`] on malformed input or an
    /// authentication-tag mismatch (the peer used a different secret).
    pub fn decrypt(&self, payload_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let combined = B64.decode(payload_b64).map_err(|_| CryptoError::Decrypt)?;
        if combined.len() < NONCE_LEN {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for RoomKey {
    // Never print key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// One-way public identifier for a room, used as the relay routing key.
///
/// `hex(SHA-256(ROOM_ID_PREFIX || secret))`. Knowing the identifier does
/// not help recover the secret, and the domain prefix keeps it disjoint
/// from the key-derivation salt.
pub fn public_room_id(secret: &str) -> String {
    let digest = Sha256::digest(format!("{ROOM_ID_PREFIX}{secret}"));
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
