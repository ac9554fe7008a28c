//! AES-256-GCM encryption for credential tokens.
//!
//! Each token is encrypted separately with a fresh 96-bit nonce. The stored
//! form is `base64(nonce || ciphertext || tag)` so one column carries
//! everything needed to decrypt.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use thiserror::Error as ThisError;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag appended to every ciphertext
const TAG_SIZE: usize = 16;

#[derive(Debug, ThisError)]
pub enum EncryptionError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(String),

    #[error("ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("ciphertext is truncated")]
    Truncated,

    #[error("encryption failed")]
    Encrypt,

    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,

    #[error("decrypted data is not valid UTF-8")]
    InvalidUtf8,
}

/// 256-bit master key. Held in memory only.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Validates that the master key is exactly 32 bytes when base64 decoded.
    pub fn from_base64(key_base64: &str) -> Result<Self, EncryptionError> {
        let key_bytes = BASE64
            .decode(key_base64.trim())
            .map_err(|e| EncryptionError::InvalidKey(format!("not valid base64: {}", e)))?;
        Self::from_bytes(&key_bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncryptionError> {
        let key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            EncryptionError::InvalidKey(format!(
                "key must be {} bytes (256 bits), got {} bytes",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// Encrypts plaintext with a random nonce.
pub fn encrypt(plaintext: &str, key: &EncryptionKey) -> Result<String, EncryptionError> {
    // Generate random nonce (never reuse!)
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = key
        .cipher()
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| EncryptionError::Encrypt)?;

    let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(blob))
}

/// Decrypts a value produced by [`encrypt`].
///
/// A truncated or tampered value always fails; it never yields partial
/// plaintext.
pub fn decrypt(encoded: &str, key: &EncryptionKey) -> Result<String, EncryptionError> {
    let blob = BASE64.decode(encoded)?;

    if blob.len() < NONCE_SIZE + TAG_SIZE {
        return Err(EncryptionError::Truncated);
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = key
        .cipher()
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::Decrypt)?;

    String::from_utf8(plaintext).map_err(|_| EncryptionError::InvalidUtf8)
}
