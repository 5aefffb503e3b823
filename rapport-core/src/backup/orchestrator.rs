//! Backup and restore orchestration.
//!
//! Each operation runs its stages in order. Fatal stage failures end the
//! operation with an error; best-effort stages record a `SoftFailure` and
//! let it continue. Progress is reported throughout and the display is
//! always closed, whichever way the operation ends.

use crate::backup::attachments::{collect_device_refs, AttachmentBundler, AttachmentRestoreReport};
use crate::backup::metadata::MetadataStore;
use crate::backup::models::{
    item_counts, AttachmentLink, BackupDescriptor, BackupListing, BackupPayload, BackupReport, DeleteReport,
    RestoreReport, SoftFailure, SoftFailureKind, StageOutcome,
};
use crate::backup::naming::{BackupNaming, BACKUP_MIME};
use crate::backup::progress::ProgressReporter;
use crate::backup::retention::{RetentionManager, RetentionReport};
use crate::config::BackupConfig;
use crate::crypto::{ContentCipher, CryptoError, EncryptedEnvelope, KeyDerivation};
use crate::storage::{
    AuthProvider, Collection, CollectionData, DeviceFs, Identity, LocalStore, RemoteFile,
    RemoteStorage,
};
use crate::{BackupError, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Capabilities the orchestrator is built from
pub struct Collaborators {
    pub store: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStorage>,
    pub cipher: Arc<dyn ContentCipher>,
    pub keys: Arc<dyn KeyDerivation>,
    pub auth: Arc<dyn AuthProvider>,
    /// Present on mobile builds only
    pub device_fs: Option<Arc<dyn DeviceFs>>,
}

/// What the orchestrator is doing right now.
///
/// Backup and restore share one state, so they exclude each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperationState {
    Idle = 0,
    BackingUp = 1,
    Restoring = 2,
}

impl OperationState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::BackingUp,
            2 => Self::Restoring,
            _ => Self::Idle,
        }
    }
}

/// Holds the operation state for one call and resets it to `Idle` on drop
struct InFlight<'a> {
    state: &'a AtomicU8,
}

impl<'a> InFlight<'a> {
    fn enter(state: &'a AtomicU8, to: OperationState) -> Result<Self> {
        state
            .compare_exchange(
                OperationState::Idle as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| BackupError::OperationInProgress)?;
        Ok(Self { state })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.state.store(OperationState::Idle as u8, Ordering::SeqCst);
    }
}

fn join_error(e: tokio::task::JoinError) -> BackupError {
    BackupError::Encryption(CryptoError::EncryptionFailed(format!("worker task failed: {}", e)))
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    naming: BackupNaming,
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStorage>,
    cipher: Arc<dyn ContentCipher>,
    keys: Arc<dyn KeyDerivation>,
    auth: Arc<dyn AuthProvider>,
    bundler: Option<AttachmentBundler>,
    metadata: Arc<MetadataStore>,
    retention: RetentionManager,
    progress: ProgressReporter,
    state: AtomicU8,
}

impl BackupOrchestrator {
    pub fn new(config: BackupConfig, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            remote,
            cipher,
            keys,
            auth,
            device_fs,
        } = collaborators;

        let naming = BackupNaming::new(&config.file_prefix);
        let progress = ProgressReporter::new(&config.progress);
        let metadata = Arc::new(MetadataStore::new(store.clone(), remote.clone(), naming.clone()));
        let retention = RetentionManager::new(remote.clone(), metadata.clone(), naming.clone());
        let bundler =
            device_fs.map(|fs| AttachmentBundler::new(fs, cipher.clone(), progress.clone()));

        Self {
            config,
            naming,
            store,
            remote,
            cipher,
            keys,
            auth,
            bundler,
            metadata,
            retention,
            progress,
            state: AtomicU8::new(OperationState::Idle as u8),
        }
    }

    pub fn progress(&self) -> &ProgressReporter {
        &self.progress
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn state(&self) -> OperationState {
        OperationState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_backing_up(&self) -> bool {
        self.state() == OperationState::BackingUp
    }

    pub fn is_restoring(&self) -> bool {
        self.state() == OperationState::Restoring
    }

    fn require_identity(&self) -> Result<Identity> {
        self.auth.current_identity().ok_or(BackupError::AuthRequired)
    }

    fn derive_password(&self, identity: &Identity) -> Result<Zeroizing<String>> {
        Ok(self.keys.derive_password(&identity.account_id)?)
    }

    /// Leave the final percent visible for a moment, then close the display
    async fn finish(&self) {
        let delay = self.config.progress.close_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.progress.close();
    }

    fn report_failure(&self, operation: &str, e: &BackupError) {
        error!("{} failed: {}", operation, e);
        self.progress.fail(&e.to_string());
    }

    // --- Create ---

    /// Collect, encrypt and upload a full backup.
    pub async fn create_backup(&self) -> Result<BackupReport> {
        let _guard = InFlight::enter(&self.state, OperationState::BackingUp)?;
        let identity = self.require_identity()?;

        info!("Starting backup");
        let result = self.run_backup(&identity).await;
        if let Err(e) = &result {
            self.report_failure("Backup", e);
        }
        self.finish().await;
        result
    }

    async fn run_backup(&self, identity: &Identity) -> Result<BackupReport> {
        let password = self.derive_password(identity)?;

        self.progress.update(5, "Collecting data", false);
        let data = self.collect_data()?;
        let counts = item_counts(&data);
        self.progress.update(10, "Data collected", false);

        let refs = match &self.bundler {
            Some(_) => collect_device_refs(&data),
            None => Vec::new(),
        };
        self.progress.update(12, "Checking attachments", false);

        let mut package = None;
        if let (Some(bundler), false) = (&self.bundler, refs.is_empty()) {
            info!("Bundling {} attachments", refs.len());
            let outcome = bundler.bundle(&refs, &password, 15..40).await?;
            if outcome.files_skipped > 0 {
                warn!("{} attachments could not be read", outcome.files_skipped);
            }
            package = outcome.package_bytes;
        }

        self.progress.update(45, "Encrypting backup", false);
        let now = Utc::now();
        let payload = BackupPayload::new(
            &data,
            self.config.device_class,
            self.config.include_photos,
            now,
        );
        let envelope_bytes = self.seal(payload.to_json()?, &password).await?;
        let size_bytes = envelope_bytes.len() as u64;

        self.progress.update(55, "Uploading backup", false);
        let main = self
            .remote
            .upload_file(&self.naming.main_file_name(now), envelope_bytes, BACKUP_MIME)
            .await
            .map_err(|e| BackupError::Upload(e.to_string()))?;
        info!("Uploaded {} ({})", main.name, main.id);
        self.progress.update(65, "Backup uploaded", false);

        let attachments = match package {
            Some(bytes) => Some(self.upload_attachments(now, bytes).await?),
            None => None,
        };

        let mut soft_failures = Vec::new();

        self.progress.update(90, "Saving backup details", false);
        let descriptor = BackupDescriptor {
            id: main.id.clone(),
            file_name: main.name.clone(),
            created_at: now,
            size_bytes,
            has_attachments: attachments.is_some(),
            attachments_file_id: attachments.as_ref().map(|f| f.id.clone()),
            origin_device_class: self.config.device_class,
            item_counts: counts.clone(),
        };
        StageOutcome::from_result(
            SoftFailureKind::MetadataSync,
            self.persist_metadata(descriptor).await,
        )
        .record(&mut soft_failures);

        self.progress.update(95, "Removing old backups", false);
        match self.retention.cleanup(self.config.retention_count).await {
            Ok(report) => soft_failures.extend(report.soft_failures),
            Err(e) => {
                StageOutcome::SoftFailure(SoftFailure::new(SoftFailureKind::Retention, e))
                    .record(&mut soft_failures)
            }
        }

        self.progress.update(100, "Backup complete", false);
        info!("Backup complete: {}", main.name);

        Ok(BackupReport {
            success: true,
            file_id: main.id,
            file_name: main.name,
            has_attachments: attachments.is_some(),
            attachments_file_id: attachments.map(|f| f.id),
            item_counts: counts,
            soft_failures,
        })
    }

    fn collect_data(&self) -> Result<CollectionData> {
        let mut data = CollectionData::new();
        for collection in Collection::ALL {
            let mut records = self.store.get_all(collection)?;
            if collection == Collection::Clients && !self.config.include_photos {
                for record in &mut records {
                    if let Value::Object(map) = record {
                        map.remove("photo");
                    }
                }
            }
            data.insert(collection, records);
        }
        Ok(data)
    }

    /// Encrypt the payload off the async runtime
    async fn seal(&self, json: String, password: &str) -> Result<Vec<u8>> {
        let cipher = self.cipher.clone();
        let password = Zeroizing::new(password.to_string());

        let envelope = tokio::task::spawn_blocking(move || cipher.encrypt(&json, &password))
            .await
            .map_err(join_error)??;
        Ok(envelope.to_json()?)
    }

    async fn upload_attachments(
        &self,
        at: chrono::DateTime<Utc>,
        bytes: Vec<u8>,
    ) -> Result<RemoteFile> {
        let name = self.naming.attachments_file_name(at);
        let ticker = self.progress.simulate(
            70,
            self.config.progress.pulse_ceiling,
            "Uploading attachments",
        );
        let result = self.remote.upload_file(&name, bytes, BACKUP_MIME).await;
        ticker.stop().await;

        let file = result.map_err(|e| BackupError::Upload(format!("attachments: {}", e)))?;
        info!("Uploaded {} ({})", file.name, file.id);
        Ok(file)
    }

    async fn persist_metadata(&self, descriptor: BackupDescriptor) -> Result<()> {
        self.metadata
            .put(descriptor)
            .map_err(|e| BackupError::MetadataSync(e.to_string()))?;
        self.metadata.sync_to_remote().await
    }

    // --- Restore ---

    /// Download, decrypt and import a backup, replacing local data.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<RestoreReport> {
        let _guard = InFlight::enter(&self.state, OperationState::Restoring)?;
        let identity = self.require_identity()?;

        info!("Starting restore of {}", backup_id);
        let result = self.run_restore(&identity, backup_id).await;
        if let Err(e) = &result {
            self.report_failure("Restore", e);
        }
        self.finish().await;

        if result.is_ok() {
            self.progress.request_reload();
        }
        result
    }

    async fn run_restore(&self, identity: &Identity, backup_id: &str) -> Result<RestoreReport> {
        let mut soft_failures = Vec::new();

        self.progress.update(5, "Preparing restore", false);
        StageOutcome::from_result(
            SoftFailureKind::MetadataSync,
            self.metadata.sync_from_remote().await,
        )
        .record(&mut soft_failures);
        let descriptor = match self.metadata.get(backup_id) {
            Ok(d) => d,
            Err(e) => {
                StageOutcome::SoftFailure(SoftFailure::new(SoftFailureKind::MetadataSync, e))
                    .record(&mut soft_failures);
                None
            }
        };

        self.progress.update(10, "Downloading backup", false);
        let bytes = self
            .remote
            .download_file(backup_id)
            .await
            .map_err(|e| BackupError::Download(e.to_string()))?;

        self.progress.update(30, "Reading backup", false);
        let envelope = EncryptedEnvelope::from_json(&bytes)
            .map_err(|e| BackupError::Validation(e.to_string()))?;

        self.progress.update(40, "Decrypting backup", false);
        let password = self.derive_password(identity)?;
        let text = self.open(envelope, &password).await?;

        self.progress.update(55, "Validating backup", false);
        let payload = BackupPayload::parse(&text)?;
        let data = payload.collection_data();

        let mut attachments_restored = 0;
        if let Some(descriptor) = descriptor.as_ref().filter(|d| d.has_attachments) {
            match self.restore_attachments(descriptor, &password).await {
                Ok(Some(report)) => {
                    attachments_restored = report.restored;
                    if report.failed > 0 {
                        soft_failures.push(SoftFailure::new(
                            SoftFailureKind::Attachment,
                            format!("{} attachments could not be written", report.failed),
                        ));
                    }
                }
                Ok(None) => {}
                Err(e) => StageOutcome::SoftFailure(SoftFailure::new(SoftFailureKind::Attachment, e))
                    .record(&mut soft_failures),
            }
        }

        self.progress.update(85, "Importing data", false);
        self.store.import_data(&data, true)?;

        self.progress.update(100, "Restore complete", false);
        info!("Restore of {} complete", backup_id);

        Ok(RestoreReport {
            success: true,
            backup_id: backup_id.to_string(),
            item_counts: item_counts(&data),
            attachments_restored,
            reload_scheduled: true,
            soft_failures,
        })
    }

    async fn open(&self, envelope: EncryptedEnvelope, password: &str) -> Result<String> {
        let cipher = self.cipher.clone();
        let password = Zeroizing::new(password.to_string());

        let text = tokio::task::spawn_blocking(move || cipher.decrypt(&envelope, &password))
            .await
            .map_err(join_error)??;
        Ok(text)
    }

    /// `Ok(None)` when this device keeps no attachments on disk
    async fn restore_attachments(
        &self,
        descriptor: &BackupDescriptor,
        password: &str,
    ) -> Result<Option<AttachmentRestoreReport>> {
        let Some(bundler) = &self.bundler else {
            debug!("Skipping attachments: no device filesystem");
            return Ok(None);
        };

        self.progress.update(60, "Restoring attachments", false);
        let file_id = match &descriptor.attachments_file_id {
            Some(id) => id.clone(),
            None => self
                .find_paired_attachments(&descriptor.file_name)
                .await?
                .ok_or_else(|| {
                    BackupError::Attachment(format!("no archive found for {}", descriptor.file_name))
                })?,
        };

        let bytes = self
            .remote
            .download_file(&file_id)
            .await
            .map_err(|e| BackupError::Attachment(format!("download: {}", e)))?;

        let report = bundler.restore(bytes, password, 60..80).await?;
        info!("Restored {} attachments", report.restored);
        Ok(Some(report))
    }

    /// Locate an archive by the main file's date token
    async fn find_paired_attachments(&self, main_name: &str) -> Result<Option<String>> {
        let Some(pair_name) = self.naming.paired_attachments_name(main_name) else {
            return Ok(None);
        };
        let files = self
            .remote
            .list_files(&pair_name)
            .await
            .map_err(|e| BackupError::Attachment(format!("list: {}", e)))?;
        Ok(files.into_iter().find(|f| f.name == pair_name).map(|f| f.id))
    }

    // --- Listing and deletion ---

    /// Remote main backups joined with their descriptors, newest first
    pub async fn list_available_backups(&self) -> Result<Vec<BackupListing>> {
        if let Err(e) = self.metadata.sync_from_remote().await {
            warn!("Metadata sync before listing failed: {}", e);
        }

        let files = self
            .remote
            .list_backups()
            .await
            .map_err(|e| BackupError::Download(e.to_string()))?;
        let descriptors: HashMap<String, BackupDescriptor> = self
            .metadata
            .get_all()
            .unwrap_or_else(|e| {
                warn!("Local metadata unreadable: {}", e);
                Vec::new()
            })
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();

        let mut listings: Vec<BackupListing> = files
            .into_iter()
            .filter(|f| self.naming.is_main_backup(&f.name))
            .map(|f| match descriptors.get(&f.id) {
                Some(d) => BackupListing {
                    id: f.id,
                    file_name: f.name,
                    created_at: d.created_at,
                    modified_time: f.modified_time,
                    size_bytes: f.size.or(Some(d.size_bytes)),
                    device_type: d.origin_device_class.as_str().to_string(),
                    has_attachments: d.has_attachments,
                    item_counts: d.item_counts.clone(),
                },
                None => BackupListing {
                    id: f.id,
                    file_name: f.name,
                    created_at: f.created_time,
                    modified_time: f.modified_time,
                    size_bytes: f.size,
                    device_type: "unknown".to_string(),
                    has_attachments: false,
                    item_counts: Default::default(),
                },
            })
            .collect();

        listings.sort_by(|a, b| b.modified_time.cmp(&a.modified_time));
        Ok(listings)
    }

    /// Delete one backup and its attachments archive
    pub async fn delete_backup(&self, backup_id: &str) -> Result<DeleteReport> {
        self.require_identity()?;
        let mut report = DeleteReport {
            backup_id: backup_id.to_string(),
            ..Default::default()
        };

        let descriptor = self.metadata.get(backup_id).ok().flatten();
        let pair = match AttachmentLink::resolve(descriptor.as_ref()) {
            AttachmentLink::Absent => None,
            AttachmentLink::Linked(id) => Some(id),
            AttachmentLink::ByDate => match self.pair_by_listing(backup_id, descriptor.as_ref()).await {
                Ok(found) => found,
                Err(e) => {
                    StageOutcome::SoftFailure(SoftFailure::new(SoftFailureKind::Delete, e))
                        .record(&mut report.soft_failures);
                    None
                }
            },
        };

        self.remote
            .delete_file(backup_id)
            .await
            .map_err(|e| BackupError::Delete(e.to_string()))?;
        info!("Deleted backup {}", backup_id);

        if let Some(pair_id) = pair {
            match self.remote.delete_file(&pair_id).await {
                Ok(()) => report.attachments_deleted = Some(pair_id),
                Err(e) => StageOutcome::SoftFailure(SoftFailure::new(
                    SoftFailureKind::Delete,
                    format!("attachments {}: {}", pair_id, e),
                ))
                .record(&mut report.soft_failures),
            }
        }

        StageOutcome::from_result(SoftFailureKind::MetadataSync, self.metadata.delete(backup_id))
            .record(&mut report.soft_failures);
        StageOutcome::from_result(
            SoftFailureKind::MetadataSync,
            self.metadata.sync_to_remote().await,
        )
        .record(&mut report.soft_failures);

        Ok(report)
    }

    async fn pair_by_listing(
        &self,
        backup_id: &str,
        descriptor: Option<&BackupDescriptor>,
    ) -> Result<Option<String>> {
        let files = self
            .remote
            .list_backups()
            .await
            .map_err(|e| BackupError::Delete(format!("list: {}", e)))?;

        let main_name = match descriptor {
            Some(d) => Some(d.file_name.clone()),
            None => files.iter().find(|f| f.id == backup_id).map(|f| f.name.clone()),
        };
        let Some(pair_name) = main_name.and_then(|n| self.naming.paired_attachments_name(&n)) else {
            return Ok(None);
        };

        Ok(files.into_iter().find(|f| f.name == pair_name).map(|f| f.id))
    }

    /// Run retention on demand
    pub async fn prune(&self, keep_count: usize) -> Result<RetentionReport> {
        if keep_count == 0 {
            return Err(BackupError::Config("keep count must be at least 1".into()));
        }
        self.require_identity()?;
        self.retention.cleanup(keep_count).await
    }
}
