//! Rapport Core Library
//!
//! Encrypted backup and restore for the Rapport personal CRM: collects
//! local records and device attachments, seals them with an
//! account-derived key, and keeps a bounded set of backups in remote
//! storage alongside a mirrored metadata registry.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod database;
pub mod platform;
pub mod storage;

pub use backup::{
    BackupDescriptor, BackupListing, BackupOrchestrator, BackupReport, Collaborators,
    DeleteReport, DeviceClass, OperationState, ProgressEvent, ProgressReporter, RestoreReport,
    SoftFailure, SoftFailureKind,
};
pub use config::BackupConfig;
pub use crypto::{ContentCipher, CryptoError, EncryptedEnvelope, HkdfKeyDerivation, KeyDerivation, PasswordCipher};
pub use database::{DatabaseError, SqliteStore};
pub use storage::{
    AuthProvider, Collection, DeviceFs, Identity, LocalStore, RemoteFile, RemoteStorage,
    StorageError,
};

use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// General error type for backup operations
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Sign in to remote storage before backing up or restoring")]
    AuthRequired,

    #[error("Another backup or restore is already in progress")]
    OperationInProgress,

    #[error("Encryption failure: {0}")]
    Encryption(CryptoError),

    #[error("Backup was created by a different account")]
    WrongPassword,

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Invalid backup contents: {0}")]
    Validation(String),

    #[error("Attachment error: {0}")]
    Attachment(String),

    #[error("Metadata sync failed: {0}")]
    MetadataSync(String),

    #[error("Retention cleanup failed: {0}")]
    Retention(String),

    #[error("Delete failed: {0}")]
    Delete(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackupError {
    /// Whether this error aborts the enclosing operation.
    ///
    /// Metadata mirroring and retention failures are always soft.
    /// `Attachment` is fatal while bundling; restore downgrades it itself.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::MetadataSync(_) | Self::Retention(_))
    }
}

impl From<CryptoError> for BackupError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::WrongPassword => Self::WrongPassword,
            other => Self::Encryption(other),
        }
    }
}
