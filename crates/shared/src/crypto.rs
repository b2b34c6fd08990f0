//! Symmetric encryption for secrets at rest (user passwords).
//!
//! The key is configured once per process; every encryption draws a fresh
//! nonce, so equal plaintexts never produce equal ciphertexts.
//!
//! Ciphertext layout: `nonce (12 bytes) || sealed payload || tag (16 bytes)`.

use std::sync::OnceLock;

use aes_gcm::{aead::Aead, Aes128Gcm, Aes256Gcm, KeyInit, Nonce};
use thiserror::Error;

/// Length of the random nonce prefixed to every ciphertext.
pub const NONCE_LEN: usize = 12;

/// Length of the authentication tag appended by AES-GCM.
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("No encryption key has been configured")]
    KeyNotConfigured,
    #[error("Encryption key has already been configured")]
    KeyAlreadyConfigured,
    #[error("Encryption key must be 16 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("Ciphertext too short")]
    CiphertextTooShort,
    #[error("Encryption failed")]
    Encrypt,
    #[error("Decryption failed")]
    Decrypt,
}

enum CipherKey {
    Aes128(Aes128Gcm),
    Aes256(Aes256Gcm),
}

/// Process-wide cipher. Construct once at startup and share by reference.
#[derive(Default)]
pub struct Cipher {
    key: OnceLock<CipherKey>,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl Cipher {
    /// An unconfigured cipher; all operations fail until [`set_key`](Self::set_key).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cipher already holding `key`.
    pub fn with_key(key: &[u8]) -> Result<Self, CipherError> {
        let cipher = Self::new();
        cipher.set_key(key)?;
        Ok(cipher)
    }

    /// Configure the key. Accepts AES-128 (16 byte) or AES-256 (32 byte) keys.
    pub fn set_key(&self, key: &[u8]) -> Result<(), CipherError> {
        let parsed = match key.len() {
            16 => Aes128Gcm::new_from_slice(key).map(CipherKey::Aes128),
            32 => Aes256Gcm::new_from_slice(key).map(CipherKey::Aes256),
            len => return Err(CipherError::InvalidKeyLength(len)),
        }
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;

        self.key
            .set(parsed)
            .map_err(|_| CipherError::KeyAlreadyConfigured)
    }

    pub fn set_key_str(&self, key: &str) -> Result<(), CipherError> {
        self.set_key(key.as_bytes())
    }

    pub fn is_configured(&self) -> bool {
        self.key.get().is_some()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.key.get().ok_or(CipherError::KeyNotConfigured)?;
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = match key {
            CipherKey::Aes128(c) => c.encrypt(nonce, plaintext),
            CipherKey::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.key.get().ok_or(CipherError::KeyNotConfigured)?;
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::CiphertextTooShort);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        match key {
            CipherKey::Aes128(c) => c.decrypt(nonce, sealed),
            CipherKey::Aes256(c) => c.decrypt(nonce, sealed),
        }
        .map_err(|_| CipherError::Decrypt)
    }
}
