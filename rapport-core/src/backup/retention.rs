//! Bounded retention of remote backups.

use crate::backup::metadata::MetadataStore;
use crate::backup::models::{AttachmentLink, SoftFailure, SoftFailureKind, StageOutcome};
use crate::backup::naming::BackupNaming;
use crate::storage::{RemoteFile, RemoteStorage};
use crate::{BackupError, Result};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub kept: usize,
    /// Remote ids of deleted main backups
    pub deleted: Vec<String>,
    pub attachments_deleted: Vec<String>,
    pub soft_failures: Vec<SoftFailure>,
}

pub struct RetentionManager {
    remote: Arc<dyn RemoteStorage>,
    metadata: Arc<MetadataStore>,
    naming: BackupNaming,
}

impl RetentionManager {
    pub fn new(remote: Arc<dyn RemoteStorage>, metadata: Arc<MetadataStore>, naming: BackupNaming) -> Self {
        Self {
            remote,
            metadata,
            naming,
        }
    }

    /// Keep the `keep_count` most recently modified main backups and delete
    /// the rest along with their attachment archives.
    ///
    /// Only listing failures are returned as errors. Individual deletions
    /// that fail are recorded in the report.
    pub async fn cleanup(&self, keep_count: usize) -> Result<RetentionReport> {
        let listed = self
            .remote
            .list_backups()
            .await
            .map_err(|e| BackupError::Retention(format!("list: {}", e)))?;

        let mut mains: Vec<&RemoteFile> = listed
            .iter()
            .filter(|f| self.naming.is_main_backup(&f.name))
            .collect();
        mains.sort_by(|a, b| b.modified_time.cmp(&a.modified_time));

        let mut report = RetentionReport {
            kept: mains.len().min(keep_count),
            ..Default::default()
        };
        if mains.len() <= keep_count {
            return Ok(report);
        }

        info!(
            "Retention: keeping {} of {} backups",
            keep_count,
            mains.len()
        );

        for file in &mains[keep_count..] {
            if let Err(e) = self.remote.delete_file(&file.id).await {
                warn!("Failed to delete old backup {}: {}", file.name, e);
                report.soft_failures.push(SoftFailure::new(
                    SoftFailureKind::Delete,
                    format!("{}: {}", file.name, e),
                ));
                continue;
            }
            report.deleted.push(file.id.clone());

            if let Some(pair_id) = self.paired_attachments(file, &listed) {
                match self.remote.delete_file(&pair_id).await {
                    Ok(()) => report.attachments_deleted.push(pair_id),
                    Err(e) => {
                        warn!("Failed to delete attachments of {}: {}", file.name, e);
                        report.soft_failures.push(SoftFailure::new(
                            SoftFailureKind::Delete,
                            format!("attachments of {}: {}", file.name, e),
                        ));
                    }
                }
            }

            StageOutcome::from_result(SoftFailureKind::MetadataSync, self.metadata.delete(&file.id))
                .record(&mut report.soft_failures);
        }

        StageOutcome::from_result(
            SoftFailureKind::MetadataSync,
            self.metadata.sync_to_remote().await,
        )
        .record(&mut report.soft_failures);

        Ok(report)
    }

    /// Attachments archive belonging to `main`. The descriptor decides;
    /// the date token is only consulted when it cannot.
    fn paired_attachments(&self, main: &RemoteFile, listed: &[RemoteFile]) -> Option<String> {
        let descriptor = self.metadata.get(&main.id).ok().flatten();
        match AttachmentLink::resolve(descriptor.as_ref()) {
            AttachmentLink::Absent => None,
            AttachmentLink::Linked(id) => Some(id),
            AttachmentLink::ByDate => {
                let pair_name = self.naming.paired_attachments_name(&main.name)?;
                listed
                    .iter()
                    .find(|f| f.name == pair_name)
                    .map(|f| f.id.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::models::{BackupDescriptor, DeviceClass};
    use crate::storage::memory::{MemoryLocalStore, MemoryRemoteStorage};
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::BTreeMap;

    struct Fixture {
        remote: Arc<MemoryRemoteStorage>,
        metadata: Arc<MetadataStore>,
        retention: RetentionManager,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStorage::new());
        let naming = BackupNaming::default();
        let metadata = Arc::new(MetadataStore::new(store, remote.clone(), naming.clone()));
        let retention = RetentionManager::new(remote.clone(), metadata.clone(), naming);
        Fixture {
            remote,
            metadata,
            retention,
        }
    }

    /// One main backup per day starting 2024-01-01, each with an archive
    fn seed_days(f: &Fixture, days: i64) -> Vec<(String, String)> {
        let naming = BackupNaming::default();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
        (0..days)
            .map(|d| {
                let at = start + Duration::days(d);
                let main = f.remote.insert_file(&naming.main_file_name(at), vec![0; 4], at);
                let pair = f
                    .remote
                    .insert_file(&naming.attachments_file_name(at), vec![1; 4], at);
                (main.id, pair.id)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_cleanup_deletes_oldest_with_pairs() {
        let f = fixture();
        let seeded = seed_days(&f, 12);

        let report = f.retention.cleanup(10).await.unwrap();

        assert_eq!(report.kept, 10);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.deleted.contains(&seeded[0].0));
        assert!(report.deleted.contains(&seeded[1].0));
        assert!(report.attachments_deleted.contains(&seeded[0].1));
        assert!(report.attachments_deleted.contains(&seeded[1].1));
        assert!(report.soft_failures.is_empty());

        let naming = BackupNaming::default();
        let remaining = f
            .remote
            .files()
            .iter()
            .filter(|r| naming.is_main_backup(&r.name))
            .count();
        assert_eq!(remaining, 10);
    }

    #[tokio::test]
    async fn test_cleanup_under_limit_is_noop() {
        let f = fixture();
        seed_days(&f, 3);
        let report = f.retention.cleanup(10).await.unwrap();
        assert_eq!(report.kept, 3);
        assert!(report.deleted.is_empty());
        assert_eq!(f.remote.files().len(), 6);
    }

    #[tokio::test]
    async fn test_delete_failure_does_not_stop_loop() {
        let f = fixture();
        let seeded = seed_days(&f, 4);
        f.remote.fail_delete(&seeded[0].0);

        let report = f.retention.cleanup(1).await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert_eq!(report.soft_failures.len(), 1);
        assert_eq!(report.soft_failures[0].kind, SoftFailureKind::Delete);
        // The failed main keeps its archive
        assert!(!report.attachments_deleted.contains(&seeded[0].1));
    }

    #[tokio::test]
    async fn test_explicit_link_preferred_over_date_token() {
        let f = fixture();
        let naming = BackupNaming::default();
        let old = Utc.with_ymd_and_hms(2023, 6, 1, 9, 0, 0).unwrap();
        let main = f.remote.insert_file(&naming.main_file_name(old), vec![0], old);
        let odd = f.remote.insert_file("renamed-archive.zip.enc", vec![1], old);
        f.remote
            .insert_file(&naming.main_file_name(Utc::now()), vec![0], Utc::now());

        f.metadata
            .put(BackupDescriptor {
                id: main.id.clone(),
                file_name: main.name.clone(),
                created_at: old,
                size_bytes: 1,
                has_attachments: true,
                attachments_file_id: Some(odd.id.clone()),
                origin_device_class: DeviceClass::Mobile,
                item_counts: BTreeMap::new(),
            })
            .unwrap();

        let report = f.retention.cleanup(1).await.unwrap();
        assert_eq!(report.attachments_deleted, vec![odd.id]);
        assert!(f.metadata.get(&main.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_listing_failure_is_retention_error() {
        let f = fixture();
        f.remote.fail_listing(true);
        let err = f.retention.cleanup(1).await.unwrap_err();
        assert!(matches!(err, BackupError::Retention(_)));
    }
}
