//! Cryptographic primitives for backup payloads.
//!
//! This module provides:
//! - Argon2id key derivation for envelope keys
//! - HKDF-SHA256 derivation of the account-bound backup password
//! - AES-256-GCM encryption/decryption
//! - Self-describing envelopes with a key-check tag

pub mod cipher;
pub mod envelope;
pub mod kdf;

pub use cipher::{decrypt_blob, encrypt_blob, BackupKey};
pub use envelope::{ContentCipher, EncryptedEnvelope, PasswordCipher};
pub use kdf::{derive_envelope_key, HkdfKeyDerivation, KdfParams, KeyDerivation};

use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The derived key does not match the key that sealed the envelope.
    #[error("Wrong password for this backup")]
    WrongPassword,

    #[error("Authentication failed - data may have been tampered with")]
    AuthenticationFailed,

    #[error("Unsupported envelope: {0}")]
    UnsupportedEnvelope(String),

    #[error("Invalid nonce: {0}")]
    InvalidNonce(String),
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;
