//! Self-describing encrypted envelopes.
//!
//! An envelope carries everything needed to decrypt it again except the
//! password: the Argon2id cost, the salt, the nonce and a short key-check
//! tag. The tag lets `decrypt` report `WrongPassword` before touching the
//! ciphertext, so a key mismatch is never confused with corrupted data.

use crate::crypto::cipher::{decrypt_blob, encrypt_blob, BackupKey};
use crate::crypto::kdf::{derive_envelope_key, KdfParams};
use crate::crypto::{CryptoError, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const ENVELOPE_VERSION: u8 = 1;
pub const ALGORITHM: &str = "AES-256-GCM";
pub const KDF: &str = "argon2id";

const SALT_LEN: usize = 16;
const KEY_CHECK_LEN: usize = 16;
const KEY_CHECK_INFO: &[u8] = b"rapport-key-check-v1";

/// Ciphertext plus the key-derivation inputs that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub version: u8,
    pub algorithm: String,
    pub kdf: String,
    /// Argon2id time cost
    pub iterations: u32,
    pub memory_kib: u32,
    pub parallelism: u32,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub key_check: Vec<u8>,
    /// `ciphertext || auth_tag(16)`
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Parse an envelope from its JSON transport form
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::UnsupportedEnvelope(format!("Malformed envelope: {}", e)))
    }

    /// Serialize to the JSON transport form
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| CryptoError::EncryptionFailed(format!("Serialize envelope: {}", e)))
    }

    fn kdf_params(&self) -> KdfParams {
        KdfParams {
            memory_kib: self.memory_kib,
            iterations: self.iterations,
            parallelism: self.parallelism,
        }
    }

    fn check_supported(&self) -> Result<()> {
        if self.version != ENVELOPE_VERSION {
            return Err(CryptoError::UnsupportedEnvelope(format!(
                "version {}",
                self.version
            )));
        }
        if self.algorithm != ALGORITHM {
            return Err(CryptoError::UnsupportedEnvelope(format!(
                "algorithm {}",
                self.algorithm
            )));
        }
        if self.kdf != KDF {
            return Err(CryptoError::UnsupportedEnvelope(format!("kdf {}", self.kdf)));
        }
        if self.key_check.len() != KEY_CHECK_LEN {
            return Err(CryptoError::UnsupportedEnvelope(
                "key check has wrong length".to_string(),
            ));
        }
        Ok(())
    }
}

/// Content-encryption capability used by the backup pipeline.
///
/// The string variants seal the main JSON payload; the `_file` variants
/// seal binary archives.
pub trait ContentCipher: Send + Sync {
    fn encrypt_file(&self, plaintext: &[u8], password: &str) -> Result<EncryptedEnvelope>;

    fn decrypt_file(&self, envelope: &EncryptedEnvelope, password: &str) -> Result<Vec<u8>>;

    fn encrypt(&self, plaintext: &str, password: &str) -> Result<EncryptedEnvelope> {
        self.encrypt_file(plaintext.as_bytes(), password)
    }

    fn decrypt(&self, envelope: &EncryptedEnvelope, password: &str) -> Result<String> {
        let bytes = self.decrypt_file(envelope, password)?;
        String::from_utf8(bytes).map_err(|_| CryptoError::DecryptionFailed("Invalid UTF-8".to_string()))
    }
}

/// Argon2id + AES-256-GCM implementation of `ContentCipher`
#[derive(Debug, Clone, Default)]
pub struct PasswordCipher {
    params: KdfParams,
}

impl PasswordCipher {
    pub fn new(params: KdfParams) -> Result<Self> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }
}

impl ContentCipher for PasswordCipher {
    fn encrypt_file(&self, plaintext: &[u8], password: &str) -> Result<EncryptedEnvelope> {
        let salt: [u8; SALT_LEN] = rand::random();
        let key = derive_envelope_key(password.as_bytes(), &salt, &self.params)?;
        let (iv, ciphertext) = encrypt_blob(&key, plaintext)?;

        Ok(EncryptedEnvelope {
            version: ENVELOPE_VERSION,
            algorithm: ALGORITHM.to_string(),
            kdf: KDF.to_string(),
            iterations: self.params.iterations,
            memory_kib: self.params.memory_kib,
            parallelism: self.params.parallelism,
            salt: salt.to_vec(),
            iv: iv.to_vec(),
            key_check: key_check(&key)?,
            ciphertext,
        })
    }

    fn decrypt_file(&self, envelope: &EncryptedEnvelope, password: &str) -> Result<Vec<u8>> {
        envelope.check_supported()?;

        // Cost comes from the envelope, not from this cipher's settings, so
        // older backups made with different parameters still open.
        let key = derive_envelope_key(password.as_bytes(), &envelope.salt, &envelope.kdf_params())?;

        let expected = key_check(&key)?;
        if !bool::from(expected.as_slice().ct_eq(envelope.key_check.as_slice())) {
            return Err(CryptoError::WrongPassword);
        }

        decrypt_blob(&key, &envelope.iv, &envelope.ciphertext)
    }
}

fn key_check(key: &BackupKey) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::KdfFailed(format!("HMAC init failed: {}", e)))?;
    mac.update(KEY_CHECK_INFO);
    let tag = mac.finalize().into_bytes();
    Ok(tag[..KEY_CHECK_LEN].to_vec())
}

/// Custom base64 serialization for `Vec<u8>`.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PasswordCipher {
        PasswordCipher::new(KdfParams {
            memory_kib: 8_192,
            iterations: 1,
            parallelism: 1,
        })
        .unwrap()
    }

    #[test]
    fn roundtrip_binary_payload() {
        let c = cipher();
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();

        let envelope = c.encrypt_file(&payload, "hunter2").unwrap();
        assert_eq!(c.decrypt_file(&envelope, "hunter2").unwrap(), payload);
    }

    #[test]
    fn roundtrip_text_through_json() {
        let c = cipher();
        let envelope = c.encrypt(r#"{"clients":[]}"#, "pw").unwrap();

        let wire = envelope.to_json().unwrap();
        let parsed = EncryptedEnvelope::from_json(&wire).unwrap();

        assert_eq!(parsed, envelope);
        assert_eq!(c.decrypt(&parsed, "pw").unwrap(), r#"{"clients":[]}"#);
    }

    #[test]
    fn wrong_password_is_distinguished() {
        let c = cipher();
        let envelope = c.encrypt_file(b"secret", "right").unwrap();

        assert!(matches!(
            c.decrypt_file(&envelope, "wrong"),
            Err(CryptoError::WrongPassword)
        ));
    }

    #[test]
    fn corrupted_ciphertext_is_not_wrong_password() {
        let c = cipher();
        let mut envelope = c.encrypt_file(b"secret", "pw").unwrap();
        envelope.ciphertext[0] ^= 0xFF;

        assert!(matches!(
            c.decrypt_file(&envelope, "pw"),
            Err(CryptoError::AuthenticationFailed)
        ));
    }

    #[test]
    fn envelope_records_cost_parameters() {
        let c = cipher();
        let envelope = c.encrypt_file(b"x", "pw").unwrap();

        assert_eq!(envelope.algorithm, ALGORITHM);
        assert_eq!(envelope.kdf, KDF);
        assert_eq!(envelope.iterations, 1);
        assert_eq!(envelope.memory_kib, 8_192);
        assert_eq!(envelope.salt.len(), 16);
        assert_eq!(envelope.iv.len(), 12);
    }

    #[test]
    fn decrypt_uses_envelope_parameters() {
        let sealed = cipher().encrypt_file(b"older backup", "pw").unwrap();
        let opener = PasswordCipher::new(KdfParams {
            memory_kib: 16_384,
            iterations: 2,
            parallelism: 1,
        })
        .unwrap();

        assert_eq!(opener.decrypt_file(&sealed, "pw").unwrap(), b"older backup");
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let c = cipher();
        let mut envelope = c.encrypt_file(b"x", "pw").unwrap();
        envelope.algorithm = "AES-CBC".to_string();

        assert!(matches!(
            c.decrypt_file(&envelope, "pw"),
            Err(CryptoError::UnsupportedEnvelope(_))
        ));
    }

    #[test]
    fn malformed_json_rejected() {
        assert!(matches!(
            EncryptedEnvelope::from_json(b"not json"),
            Err(CryptoError::UnsupportedEnvelope(_))
        ));
    }
}
