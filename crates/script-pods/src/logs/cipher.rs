//! AES-256-GCM sealing of pod log messages.
//!
//! Wire format: `hex(nonce[12] || ciphertext || tag)`.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

use crate::error::{Error, Result};

pub const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;

#[derive(Clone)]
pub struct LogCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for LogCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCipher").finish_non_exhaustive()
    }
}

impl LogCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LENGTH {
            return Err(Error::EncryptionKey(format!(
                "expected a {KEY_LENGTH} byte key, got {} bytes",
                key.len()
            )));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| Error::EncryptionKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, message: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, message.as_bytes())
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let sealed = hex::decode(encoded.trim())
            .map_err(|e| Error::Decryption(format!("payload is not hex: {e}")))?;
        if sealed.len() < NONCE_LENGTH {
            return Err(Error::Decryption(
                "payload too short to hold a nonce".to_string(),
            ));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LENGTH);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Decryption(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|e| Error::Decryption(e.to_string()))
    }
}

/// Fresh random key material for one script.
#[must_use]
pub fn generate_key() -> [u8; KEY_LENGTH] {
    let mut key = [0u8; KEY_LENGTH];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
