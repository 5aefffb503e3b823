//! Device attachments packed into one encrypted zip archive.

use crate::backup::models::AttachmentRef;
use crate::backup::progress::ProgressReporter;
use crate::crypto::{ContentCipher, EncryptedEnvelope};
use crate::storage::{CollectionData, DeviceFs};
use crate::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Cursor, Read, Write};
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;
use zip::write::FileOptions;

pub const PACKAGE_FORMAT: &str = "zip";

/// Upper bound on buffer space reserved from a zip entry's declared size
const MAX_ENTRY_PREALLOC: usize = 1 << 20;

/// Transport form of an attachment archive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentPackage {
    pub format: String,
    pub file_count: usize,
    pub envelope: EncryptedEnvelope,
}

#[derive(Debug)]
pub struct BundleOutcome {
    /// Serialized `AttachmentPackage`, `None` when no file could be read
    pub package_bytes: Option<Vec<u8>>,
    pub files_packed: usize,
    pub files_skipped: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AttachmentRestoreReport {
    pub restored: usize,
    pub failed: usize,
}

/// Every device-backed attachment referenced by any record, first
/// occurrence of each path kept.
pub fn collect_device_refs(data: &CollectionData) -> Vec<AttachmentRef> {
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    for records in data.values() {
        for record in records {
            let Some(attachments) = record.get("attachments").and_then(|a| a.as_array()) else {
                continue;
            };
            for raw in attachments {
                let Ok(attachment) = serde_json::from_value::<AttachmentRef>(raw.clone()) else {
                    continue;
                };
                if let Some(path) = attachment.device_path() {
                    if seen.insert(path.to_string()) {
                        refs.push(attachment);
                    }
                }
            }
        }
    }

    refs
}

fn scaled(span: &Range<u8>, done: usize, total: usize) -> u8 {
    if total == 0 {
        return span.end;
    }
    let width = span.end.saturating_sub(span.start) as usize;
    span.start + (width * done / total) as u8
}

/// Declared sizes come from the archive and are not trusted
fn entry_capacity(declared: u64) -> usize {
    usize::try_from(declared).map_or(MAX_ENTRY_PREALLOC, |n| n.min(MAX_ENTRY_PREALLOC))
}

fn zip_error(e: zip::result::ZipError) -> BackupError {
    BackupError::Attachment(format!("zip: {}", e))
}

fn join_error(e: tokio::task::JoinError) -> BackupError {
    BackupError::Attachment(format!("worker task failed: {}", e))
}

pub struct AttachmentBundler {
    device_fs: Arc<dyn DeviceFs>,
    cipher: Arc<dyn ContentCipher>,
    progress: ProgressReporter,
}

impl AttachmentBundler {
    pub fn new(
        device_fs: Arc<dyn DeviceFs>,
        cipher: Arc<dyn ContentCipher>,
        progress: ProgressReporter,
    ) -> Self {
        Self {
            device_fs,
            cipher,
            progress,
        }
    }

    /// Read, zip and encrypt the referenced files.
    ///
    /// Unreadable files are skipped. Progress moves through `span` as
    /// files are read.
    pub async fn bundle(
        &self,
        refs: &[AttachmentRef],
        password: &str,
        span: Range<u8>,
    ) -> Result<BundleOutcome> {
        let total = refs.len();
        let mut entries = Vec::with_capacity(total);
        let mut skipped = 0;

        for (done, attachment) in refs.iter().enumerate() {
            let Some(path) = attachment.device_path() else {
                continue;
            };
            match self.device_fs.read_file(path).await {
                Ok(bytes) => entries.push((path.to_string(), bytes)),
                Err(e) => {
                    warn!("Skipping attachment {}: {}", path, e);
                    skipped += 1;
                }
            }
            self.progress.update(
                scaled(&span, done + 1, total),
                &format!("Packing attachments ({}/{})", done + 1, total),
                false,
            );
        }

        if entries.is_empty() {
            info!("No attachment could be read, continuing without archive");
            return Ok(BundleOutcome {
                package_bytes: None,
                files_packed: 0,
                files_skipped: skipped,
            });
        }

        let file_count = entries.len();
        let cipher = self.cipher.clone();
        let password = Zeroizing::new(password.to_string());

        let envelope = tokio::task::spawn_blocking(move || -> Result<EncryptedEnvelope> {
            let archive = write_zip(&entries)?;
            cipher
                .encrypt_file(&archive, &password)
                .map_err(|e| BackupError::Attachment(e.to_string()))
        })
        .await
        .map_err(join_error)??;

        let package = AttachmentPackage {
            format: PACKAGE_FORMAT.to_string(),
            file_count,
            envelope,
        };
        let bytes = serde_json::to_vec(&package)
            .map_err(|e| BackupError::Attachment(e.to_string()))?;

        debug!("Packed {} attachments ({} bytes)", file_count, bytes.len());
        Ok(BundleOutcome {
            package_bytes: Some(bytes),
            files_packed: file_count,
            files_skipped: skipped,
        })
    }

    /// Decrypt a package and write every entry back to the device.
    ///
    /// A failed write is counted and does not stop the remaining entries.
    pub async fn restore(
        &self,
        package_bytes: Vec<u8>,
        password: &str,
        span: Range<u8>,
    ) -> Result<AttachmentRestoreReport> {
        let package: AttachmentPackage = serde_json::from_slice(&package_bytes)
            .map_err(|e| BackupError::Attachment(format!("invalid package: {}", e)))?;
        if package.format != PACKAGE_FORMAT {
            return Err(BackupError::Attachment(format!(
                "unsupported package format: {}",
                package.format
            )));
        }

        let cipher = self.cipher.clone();
        let password = Zeroizing::new(password.to_string());
        let envelope = package.envelope;

        let entries = tokio::task::spawn_blocking(move || -> Result<Vec<(String, Vec<u8>)>> {
            let archive = cipher
                .decrypt_file(&envelope, &password)
                .map_err(|e| BackupError::Attachment(e.to_string()))?;
            read_zip(archive)
        })
        .await
        .map_err(join_error)??;

        let total = entries.len();
        let mut report = AttachmentRestoreReport::default();

        for (done, (path, bytes)) in entries.iter().enumerate() {
            match self.device_fs.write_file(path, bytes).await {
                Ok(()) => report.restored += 1,
                Err(e) => {
                    warn!("Failed to restore attachment {}: {}", path, e);
                    report.failed += 1;
                }
            }
            self.progress.update(
                scaled(&span, done + 1, total),
                &format!("Restoring attachments ({}/{})", done + 1, total),
                false,
            );
        }

        Ok(report)
    }
}

fn write_zip(entries: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for (path, bytes) in entries {
        zip.start_file(path.as_str(), options).map_err(zip_error)?;
        zip.write_all(bytes)?;
    }

    Ok(zip.finish().map_err(zip_error)?.into_inner())
}

fn read_zip(archive: Vec<u8>) -> Result<Vec<(String, Vec<u8>)>> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).map_err(zip_error)?;
    let mut entries = Vec::with_capacity(zip.len());

    for i in 0..zip.len() {
        let mut file = zip.by_index(i).map_err(zip_error)?;
        if file.is_dir() {
            continue;
        }
        let mut bytes = Vec::with_capacity(entry_capacity(file.size()));
        file.read_to_end(&mut bytes)?;
        entries.push((file.name().to_string(), bytes));
    }

    Ok(entries)
}
