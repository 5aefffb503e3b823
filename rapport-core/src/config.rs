//! Backup configuration.

use crate::backup::DeviceClass;
use crate::crypto::KdfParams;
use crate::platform;
use crate::storage::drive::{DEFAULT_API_BASE, DEFAULT_UPLOAD_BASE};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Prefix for every remote file name
    pub file_prefix: String,
    /// Main backups kept by retention
    pub retention_count: usize,
    /// Keep the `photo` field of client records
    pub include_photos: bool,
    pub device_class: DeviceClass,
    /// Salt for deriving the backup password from the account id
    pub app_salt: String,
    pub account_id: Option<String>,
    pub database_path: PathBuf,
    pub attachments_root: PathBuf,
    pub progress: ProgressConfig,
    pub kdf: KdfParams,
    pub remote: RemoteConfig,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            file_prefix: "rapport".to_string(),
            retention_count: 10,
            include_photos: true,
            device_class: platform::detect_device_class(),
            app_salt: "rapport-backup-salt-v1".to_string(),
            account_id: None,
            database_path: platform::get_default_database_path(),
            attachments_root: platform::get_default_attachments_root(),
            progress: ProgressConfig::default(),
            kdf: KdfParams::default(),
            remote: RemoteConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Delay before the progress display closes
    pub close_delay_ms: u64,
    pub pulse_interval_ms: u64,
    pub pulse_step: u8,
    /// Highest percent simulated progress may show
    pub pulse_ceiling: u8,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            close_delay_ms: 1500,
            pulse_interval_ms: 400,
            pulse_step: 2,
            pulse_ceiling: 88,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_base: String,
    pub upload_base: String,
    /// Environment variable holding the OAuth bearer token
    pub token_env: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            upload_base: DEFAULT_UPLOAD_BASE.to_string(),
            token_env: "RAPPORT_DRIVE_TOKEN".to_string(),
        }
    }
}

impl BackupConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.file_prefix.trim().is_empty() {
            return Err(BackupError::Config("file_prefix must not be empty".into()));
        }
        if self.retention_count == 0 {
            return Err(BackupError::Config(
                "retention_count must be at least 1".into(),
            ));
        }
        if self.progress.pulse_ceiling >= 100 {
            return Err(BackupError::Config(
                "progress.pulse_ceiling must be below 100".into(),
            ));
        }
        if self.progress.pulse_step == 0 {
            return Err(BackupError::Config("progress.pulse_step must be positive".into()));
        }
        self.kdf
            .validate()
            .map_err(|e| BackupError::Config(format!("kdf: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = BackupConfig::default();
        config.validate().unwrap();
        assert_eq!(config.file_prefix, "rapport");
        assert_eq!(config.retention_count, 10);
        assert_eq!(config.progress.pulse_ceiling, 88);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.toml");
        std::fs::write(
            &path,
            r#"
            file_prefix = "crm"
            retention_count = 3
            device_class = "mobile"

            [progress]
            close_delay_ms = 0
            "#,
        )
        .unwrap();

        let config = BackupConfig::load(&path).unwrap();
        assert_eq!(config.file_prefix, "crm");
        assert_eq!(config.retention_count, 3);
        assert_eq!(config.device_class, DeviceClass::Mobile);
        assert_eq!(config.progress.close_delay_ms, 0);
        assert_eq!(config.progress.pulse_interval_ms, 400);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BackupConfig::default();
        config.progress.pulse_ceiling = 100;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.retention_count = 0;
        assert!(config.validate().is_err());

        let mut config = BackupConfig::default();
        config.file_prefix = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = BackupConfig::load_or_default(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config.retention_count, 10);
    }
}
