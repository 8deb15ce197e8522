//! AES-256-GCM sealing for cached bearer tokens.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;

/// Seals and opens token strings with a single master key.
///
/// Every `seal` draws a fresh random nonce; ciphertext and nonce are returned
/// base64-encoded for storage in TEXT columns.
pub struct TokenCipher {
    cipher: Aes256Gcm,
}

impl TokenCipher {
    /// Builds a cipher from a base64-encoded 32-byte key.
    pub fn from_base64_key(key_base64: &str) -> Result<Self> {
        let key = BASE64
            .decode(key_base64.trim())
            .context("Failed to decode base64 encryption key")?;
        if key.len() != KEY_SIZE {
            return Err(anyhow!(
                "Encryption key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                key.len()
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }

    /// Returns `(ciphertext, nonce)`, both base64.
    pub fn seal(&self, plaintext: &str) -> Result<(String, String)> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;
        Ok((BASE64.encode(sealed), BASE64.encode(nonce)))
    }

    /// Fails on a wrong key, a wrong nonce or tampered ciphertext.
    pub fn open(&self, ciphertext: &str, nonce: &str) -> Result<String> {
        let sealed = BASE64
            .decode(ciphertext)
            .context("Failed to decode ciphertext")?;
        let nonce = BASE64.decode(nonce).context("Failed to decode nonce")?;
        if nonce.len() != NONCE_SIZE {
            return Err(anyhow!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            ));
        }
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_ref())
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;
        String::from_utf8(plaintext).context("Decrypted token is not valid UTF-8")
    }
}
