//! AES-256-GCM envelopes
//!
//! An envelope is a self-contained base64 string carrying everything needed
//! to decrypt one value except the user key:
//!
//! | Offset | Size | Field                         |
//! |--------|------|-------------------------------|
//! | 0      | 16   | PBKDF2 salt                   |
//! | 16     | 12   | AES-GCM nonce (IV)            |
//! | 28     | N+16 | ciphertext with 16-byte tag   |
//!
//! There is no version byte. Each envelope derives its own AES key with
//! PBKDF2-HMAC-SHA256 from the user key text and the envelope salt, so salt
//! and IV are fresh for every call.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use pbkdf2::pbkdf2_hmac;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::key_manager::UserKey;
use crate::error::{LedgerError, LedgerResult};

/// Size of the per-envelope KDF salt in bytes
pub const SALT_SIZE: usize = 16;

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Salt + nonce; the minimum decoded length of anything treated as an envelope
pub const HEADER_SIZE: usize = SALT_SIZE + NONCE_SIZE;

/// Lowest accepted PBKDF2 round count
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// Encrypts and decrypts single values into envelopes
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    iterations: u32,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self {
            iterations: MIN_KDF_ITERATIONS,
        }
    }
}

impl EnvelopeCodec {
    /// Create a codec with a specific PBKDF2 round count
    ///
    /// Both sides of an envelope must agree on the round count.
    pub fn new(iterations: u32) -> LedgerResult<Self> {
        if iterations < MIN_KDF_ITERATIONS {
            return Err(LedgerError::Config(format!(
                "PBKDF2 iterations must be at least {}, got {}",
                MIN_KDF_ITERATIONS, iterations
            )));
        }
        Ok(Self { iterations })
    }

    /// PBKDF2 round count in use
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn cipher(&self, key: &UserKey, salt: &[u8]) -> Result<Aes256Gcm, String> {
        let password = key.to_base64();
        let mut derived = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, self.iterations, &mut derived[..]);
        Aes256Gcm::new_from_slice(&derived[..])
            .map_err(|e| format!("Failed to create cipher: {}", e))
    }

    /// Encrypt a string into a base64 envelope
    ///
    /// Fails with `Encryption` if the OS random source is unavailable.
    pub fn encrypt(&self, plaintext: &str, key: &UserKey) -> LedgerResult<String> {
        let mut header = [0u8; HEADER_SIZE];
        OsRng
            .try_fill_bytes(&mut header)
            .map_err(|e| LedgerError::Encryption(format!("Random source unavailable: {}", e)))?;
        let (salt, nonce_bytes) = header.split_at(SALT_SIZE);

        let cipher = self.cipher(key, salt).map_err(LedgerError::Encryption)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(nonce_bytes), plaintext.as_bytes())
            .map_err(|e| LedgerError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        combined.extend_from_slice(&header);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Decrypt a base64 envelope back into its string
    ///
    /// Fails with `Decryption` on malformed input, a wrong key or a bad tag.
    /// Read paths recover from this by keeping the raw value.
    pub fn decrypt(&self, envelope: &str, key: &UserKey) -> LedgerResult<String> {
        let combined = STANDARD
            .decode(envelope)
            .map_err(|e| LedgerError::Decryption(format!("Invalid envelope encoding: {}", e)))?;

        if combined.len() < HEADER_SIZE + TAG_SIZE {
            return Err(LedgerError::Decryption(format!(
                "Envelope too short: {} bytes",
                combined.len()
            )));
        }

        let (salt, rest) = combined.split_at(SALT_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let cipher = self.cipher(key, salt).map_err(LedgerError::Decryption)?;
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
                .map_err(|_| {
                    LedgerError::Decryption("invalid key or corrupted data".to_string())
                })?,
        );

        String::from_utf8(plaintext.to_vec())
            .map_err(|e| LedgerError::Decryption(format!("Invalid UTF-8 in decrypted data: {}", e)))
    }

    /// Serialize a value to JSON and encrypt it
    pub fn encrypt_value<T: Serialize>(&self, value: &T, key: &UserKey) -> LedgerResult<String> {
        let json = serde_json::to_string(value)
            .map_err(|e| LedgerError::Encryption(format!("Failed to serialize value: {}", e)))?;
        self.encrypt(&json, key)
    }

    /// Decrypt an envelope and parse its JSON payload
    pub fn decrypt_value<T: DeserializeOwned>(
        &self,
        envelope: &str,
        key: &UserKey,
    ) -> LedgerResult<T> {
        let json = self.decrypt(envelope, key)?;
        serde_json::from_str(&json)
            .map_err(|e| LedgerError::Decryption(format!("Invalid JSON payload: {}", e)))
    }

    /// One-way SHA-256 digest, lowercase hex; for comparison only
    pub fn hash(data: &str) -> String {
        hex::encode(Sha256::digest(data.as_bytes()))
    }
}
