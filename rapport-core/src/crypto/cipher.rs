//! AES-256-GCM encryption and decryption for backup blobs.
//!
//! Uses AES-256-GCM with:
//! - 256-bit key
//! - 96-bit (12 byte) nonce
//! - 128-bit authentication tag appended to the ciphertext

use crate::crypto::{CryptoError, Result};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use zeroize::Zeroize;

/// Nonce length used by every envelope.
pub const NONCE_LEN: usize = 12;

/// A key derived from the backup password for one envelope.
///
/// Never persisted; the envelope carries only the salt and cost
/// parameters needed to derive it again.
#[derive(Clone)]
pub struct BackupKey {
    key: [u8; 32],
}

impl BackupKey {
    /// Create a key from raw bytes
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Get the raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl Drop for BackupKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Encrypt data using AES-256-GCM
///
/// Returns the random nonce and `ciphertext || tag`.
pub fn encrypt_blob(key: &BackupKey, plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new(key.as_bytes().into());

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let nonce_bytes: [u8; NONCE_LEN] = nonce.into();

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::EncryptionFailed(format!("{}", e)))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt data using AES-256-GCM
///
/// # Security
/// - Returns `AuthenticationFailed` if the tag doesn't verify
/// - Callers that need to tell a wrong key from tampering must check
///   the key before calling this (see `EncryptedEnvelope::key_check`)
pub fn decrypt_blob(key: &BackupKey, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let nonce_bytes: [u8; NONCE_LEN] = nonce
        .try_into()
        .map_err(|_| CryptoError::InvalidNonce(format!("expected {} bytes, got {}", NONCE_LEN, nonce.len())))?;

    if ciphertext.len() < 16 {
        return Err(CryptoError::DecryptionFailed(
            "Ciphertext too short - missing auth tag".to_string(),
        ));
    }

    let cipher = Aes256Gcm::new(key.as_bytes().into());
    let nonce = Nonce::from(nonce_bytes);

    cipher
        .decrypt(&nonce, ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailed)
}
