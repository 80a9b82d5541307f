//! AES-256-GCM sealing of upstream API keys at rest
//!
//! Stored layout is `nonce(12) || tag(16) || ciphertext`. The `aes-gcm` crate
//! produces and consumes `ciphertext || tag`, so the tag is moved around the
//! ciphertext on the way in and out.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;

use crate::error::{Error, Result};
use crate::secret::Secret;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Parse a 32-byte encryption key given as 64 hex characters or base64.
pub fn parse_encryption_key(raw: &str) -> Result<Secret<Vec<u8>>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::Crypto(
            "encryption key is empty (expected 32 bytes as hex or base64)".into(),
        ));
    }

    let bytes = if raw.len() == KEY_LEN * 2 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
        hex::decode(raw).map_err(|e| Error::Crypto(format!("invalid hex key: {e}")))?
    } else {
        STANDARD
            .decode(raw)
            .map_err(|e| Error::Crypto(format!("invalid base64 key: {e}")))?
    };

    if bytes.len() != KEY_LEN {
        return Err(Error::Crypto(format!(
            "encryption key must decode to {KEY_LEN} bytes (got {})",
            bytes.len()
        )));
    }
    Ok(Secret::new(bytes))
}

/// Symmetric cipher for provider secrets.
#[derive(Clone)]
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| Error::Crypto(format!("key must be {KEY_LEN} bytes")))?;
        Ok(Self { cipher })
    }

    /// Build a cipher from an encoded key (see [`parse_encryption_key`]).
    pub fn from_encoded(raw: &str) -> Result<Self> {
        let key = parse_encryption_key(raw)?;
        Self::new(key.expose())
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| Error::Crypto("encryption failed".into()))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, payload: &[u8]) -> Result<Secret<String>> {
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto("invalid encrypted payload".into()));
        }
        let (nonce, rest) = payload.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed.as_slice())
            .map_err(|_| Error::Crypto("decryption failed (wrong key or tampered payload)".into()))?;
        let plaintext = String::from_utf8(plaintext)
            .map_err(|_| Error::Crypto("decrypted secret is not valid UTF-8".into()))?;
        Ok(Secret::new(plaintext))
    }
}

impl fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretCipher([REDACTED])")
    }
}
