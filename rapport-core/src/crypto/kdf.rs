//! Key derivation for backup envelopes.
//!
//! Two layers:
//! - `KeyDerivation` turns the authenticated account into the backup
//!   password. It must be deterministic so a backup made on one device
//!   restores on another signed into the same account.
//! - `derive_envelope_key` stretches that password with Argon2id and a
//!   per-envelope salt into the AES key.

use crate::crypto::cipher::BackupKey;
use crate::crypto::{CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

const PASSWORD_INFO: &[u8] = b"rapport-backup-password-v1";

/// Argon2id cost parameters recorded in every envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,

    /// Time cost (number of iterations)
    pub iterations: u32,

    /// Parallelism (number of lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536, // 64 MB
            iterations: 3,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Verify that parameters are within acceptable ranges
    ///
    /// The upper bounds apply to envelopes read from remote storage, so a
    /// crafted file cannot make decryption allocate unbounded memory.
    pub fn validate(&self) -> Result<()> {
        if self.memory_kib < 8_192 {
            return Err(CryptoError::KdfFailed(
                "Memory cost too low (minimum: 8 MB)".to_string(),
            ));
        }
        if self.memory_kib > 1_048_576 {
            return Err(CryptoError::KdfFailed(
                "Memory cost too high (maximum: 1 GB)".to_string(),
            ));
        }
        if !(1..=10).contains(&self.iterations) {
            return Err(CryptoError::KdfFailed(
                "Iterations out of range (1-10)".to_string(),
            ));
        }
        if !(1..=16).contains(&self.parallelism) {
            return Err(CryptoError::KdfFailed(
                "Parallelism out of range (1-16)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derive the AES key for one envelope from the backup password
pub fn derive_envelope_key(password: &[u8], salt: &[u8], params: &KdfParams) -> Result<BackupKey> {
    params.validate()?;

    let params_obj = Params::new(params.memory_kib, params.iterations, params.parallelism, Some(32))
        .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params_obj);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    Ok(BackupKey::from_bytes(key))
}

/// Maps an authenticated account to its backup password.
pub trait KeyDerivation: Send + Sync {
    fn derive_password(&self, account_id: &str) -> Result<Zeroizing<String>>;
}

/// HKDF-SHA256 over the normalized account id, salted with a fixed
/// application salt.
#[derive(Clone)]
pub struct HkdfKeyDerivation {
    app_salt: Vec<u8>,
}

impl HkdfKeyDerivation {
    pub fn new(app_salt: impl Into<Vec<u8>>) -> Self {
        Self {
            app_salt: app_salt.into(),
        }
    }
}

impl KeyDerivation for HkdfKeyDerivation {
    fn derive_password(&self, account_id: &str) -> Result<Zeroizing<String>> {
        let normalized = account_id.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(CryptoError::KdfFailed("Empty account identifier".to_string()));
        }

        let hkdf = Hkdf::<Sha256>::new(Some(&self.app_salt), normalized.as_bytes());
        let mut okm = Zeroizing::new([0u8; 32]);
        hkdf.expand(PASSWORD_INFO, &mut okm[..])
            .map_err(|e| CryptoError::KdfFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(Zeroizing::new(STANDARD.encode(&okm[..])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            memory_kib: 8_192,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_params_default() {
        let params = KdfParams::default();
        assert_eq!(params.memory_kib, 65_536);
        assert_eq!(params.iterations, 3);
        assert_eq!(params.parallelism, 1);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_kdf_params_validation() {
        let mut params = KdfParams::default();

        params.memory_kib = 1000;
        assert!(params.validate().is_err());

        params.memory_kib = 4_000_000;
        assert!(params.validate().is_err());

        params.memory_kib = 65_536;
        params.iterations = 0;
        assert!(params.validate().is_err());

        params.iterations = 3;
        params.parallelism = 0;
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_envelope_key_is_deterministic() {
        let salt = [7u8; 16];
        let k1 = derive_envelope_key(b"password", &salt, &fast_params()).unwrap();
        let k2 = derive_envelope_key(b"password", &salt, &fast_params()).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());

        let k3 = derive_envelope_key(b"other", &salt, &fast_params()).unwrap();
        assert_ne!(k1.as_bytes(), k3.as_bytes());

        let k4 = derive_envelope_key(b"password", &[8u8; 16], &fast_params()).unwrap();
        assert_ne!(k1.as_bytes(), k4.as_bytes());
    }

    #[test]
    fn test_account_password_is_stable_across_instances() {
        let a = HkdfKeyDerivation::new(b"rapport-app".to_vec());
        let b = HkdfKeyDerivation::new(b"rapport-app".to_vec());

        let p1 = a.derive_password("Alice@Example.com").unwrap();
        let p2 = b.derive_password("  alice@example.com ").unwrap();
        assert_eq!(*p1, *p2);

        let p3 = a.derive_password("bob@example.com").unwrap();
        assert_ne!(*p1, *p3);
    }

    #[test]
    fn test_app_salt_changes_password() {
        let a = HkdfKeyDerivation::new(b"salt-a".to_vec());
        let b = HkdfKeyDerivation::new(b"salt-b".to_vec());
        assert_ne!(
            *a.derive_password("carol").unwrap(),
            *b.derive_password("carol").unwrap()
        );
    }

    #[test]
    fn test_empty_account_rejected() {
        let kd = HkdfKeyDerivation::new(b"salt".to_vec());
        assert!(kd.derive_password("   ").is_err());
    }
}
