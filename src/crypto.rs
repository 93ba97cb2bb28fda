//! Symmetric codec for text payloads.
//!
//! Payloads are sealed with AES-256-GCM under a random 96-bit nonce. The text form of a
//! ciphertext is standard base64 of `nonce || ciphertext || tag`, so it can be stored in a
//! Redis list and carried on a pub/sub channel unchanged.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::CryptoError;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Stateless encrypt/decrypt over one immutable key. Cheap to share behind an `Arc`.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl Codec {
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey(key.len()))?;
        Ok(Self { cipher })
    }

    /// Build a codec from a base64-encoded key, as it appears in configuration.
    pub fn from_base64_key(key: &str) -> Result<Self, CryptoError> {
        let raw = STANDARD.decode(key.trim())?;
        Self::new(&raw)
    }

    pub fn generate_key() -> [u8; KEY_LEN] {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let mut out = [0u8; KEY_LEN];
        out.copy_from_slice(&key);
        out
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        let raw = STANDARD.decode(ciphertext)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Truncated(raw.len()));
        }

        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CryptoError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }

    /// Decrypt a queued payload. Queue items are the base64 text produced by [`Codec::encrypt`].
    pub fn decrypt_bytes(&self, ciphertext: &[u8]) -> Result<String, CryptoError> {
        let text = std::str::from_utf8(ciphertext).map_err(|_| CryptoError::Utf8)?;
        self.decrypt(text)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Codec(AES-256-GCM)")
    }
}
