//! Platform-specific utilities for cross-platform support

use crate::backup::DeviceClass;
use std::path::{Path, PathBuf};

/// Get the platform-specific data directory for storing application data
///
/// Returns:
/// - Windows: %LOCALAPPDATA%\Rapport
/// - macOS: ~/Library/Application Support/Rapport
/// - Linux/Other: ~/.local/share/Rapport
pub fn get_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".data")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("Rapport")
}

/// Get the platform-specific config directory
pub fn get_config_dir() -> PathBuf {
    let base = dirs::config_dir()
        .or_else(dirs::data_dir)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));

    base.join("Rapport")
}

/// Get the default local database path
pub fn get_default_database_path() -> PathBuf {
    get_data_dir().join("rapport.db")
}

/// Get the default backup configuration file path
pub fn get_default_config_path() -> PathBuf {
    get_config_dir().join("backup.toml")
}

/// Get the default root for device-stored attachments
pub fn get_default_attachments_root() -> PathBuf {
    get_data_dir().join("attachments")
}

/// Create the directory that will hold `path`, if it is missing
pub fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Device class of the build target.
///
/// Only mobile builds keep attachments on the device filesystem.
pub fn detect_device_class() -> DeviceClass {
    if cfg!(any(target_os = "android", target_os = "ios")) {
        DeviceClass::Mobile
    } else {
        DeviceClass::Desktop
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_data_dir() {
        assert!(get_data_dir().to_string_lossy().ends_with("Rapport"));
    }

    #[test]
    fn test_default_paths() {
        assert!(get_default_database_path()
            .to_string_lossy()
            .ends_with("rapport.db"));
        assert!(get_default_config_path()
            .to_string_lossy()
            .ends_with("backup.toml"));
    }

    #[test]
    fn test_detect_device_class_matches_platform() {
        let class = detect_device_class();
        if cfg!(any(target_os = "android", target_os = "ios")) {
            assert_eq!(class, DeviceClass::Mobile);
        } else {
            assert_eq!(class, DeviceClass::Desktop);
        }
    }

    #[test]
    fn test_ensure_parent_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let db = tmp.path().join("nested").join("deeper").join("rapport.db");

        ensure_parent_dir(&db).unwrap();
        assert!(db.parent().unwrap().is_dir());
        // Already present, and bare file names have no parent to create
        ensure_parent_dir(&db).unwrap();
        ensure_parent_dir(Path::new("rapport.db")).unwrap();
    }
}
