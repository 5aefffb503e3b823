//! Backup metadata registry.
//!
//! The registry is one JSON object kept in the local store's settings and
//! mirrored to remote storage. The remote copy wins on every key it holds.

use crate::backup::models::{BackupDescriptor, MetadataRegistry};
use crate::backup::naming::{BackupNaming, METADATA_MIME};
use crate::storage::{LocalStore, RemoteFile, RemoteStorage};
use crate::{BackupError, Result};
use std::sync::Arc;
use tracing::debug;

/// Settings key of the local registry copy
pub const REGISTRY_KEY: &str = "backup_metadata";

/// Union of both registries; remote values replace local ones on collision
pub fn merge_registries(local: MetadataRegistry, remote: MetadataRegistry) -> MetadataRegistry {
    let mut merged = local;
    merged.extend(remote);
    merged
}

pub struct MetadataStore {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStorage>,
    naming: BackupNaming,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn LocalStore>, remote: Arc<dyn RemoteStorage>, naming: BackupNaming) -> Self {
        Self {
            store,
            remote,
            naming,
        }
    }

    fn load(&self) -> Result<MetadataRegistry> {
        match self.store.get_setting(REGISTRY_KEY)? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| BackupError::MetadataSync(format!("corrupt local registry: {}", e))),
            None => Ok(MetadataRegistry::new()),
        }
    }

    fn save(&self, registry: &MetadataRegistry) -> Result<()> {
        let json = serde_json::to_string(registry)
            .map_err(|e| BackupError::MetadataSync(e.to_string()))?;
        self.store.put_setting(REGISTRY_KEY, &json)
    }

    pub fn get(&self, id: &str) -> Result<Option<BackupDescriptor>> {
        Ok(self.load()?.remove(id))
    }

    /// All descriptors, newest first
    pub fn get_all(&self) -> Result<Vec<BackupDescriptor>> {
        let mut all: Vec<_> = self.load()?.into_values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    pub fn put(&self, descriptor: BackupDescriptor) -> Result<()> {
        let mut registry = self.load()?;
        registry.insert(descriptor.id.clone(), descriptor);
        self.save(&registry)
    }

    pub fn delete(&self, id: &str) -> Result<Option<BackupDescriptor>> {
        let mut registry = self.load()?;
        let removed = registry.remove(id);
        if removed.is_some() {
            self.save(&registry)?;
        }
        Ok(removed)
    }

    async fn find_remote(&self) -> Result<Option<RemoteFile>> {
        let name = self.naming.metadata_file_name();
        let files = self
            .remote
            .list_files(&name)
            .await
            .map_err(|e| BackupError::MetadataSync(format!("list: {}", e)))?;

        Ok(files
            .into_iter()
            .filter(|f| f.name == name)
            .max_by_key(|f| f.modified_time))
    }

    /// Merge the remote mirror into the local registry.
    ///
    /// Returns the merged registry size.
    pub async fn sync_from_remote(&self) -> Result<usize> {
        let local = self.load()?;
        let Some(file) = self.find_remote().await? else {
            debug!("No remote metadata mirror yet");
            return Ok(local.len());
        };

        let bytes = self
            .remote
            .download_file(&file.id)
            .await
            .map_err(|e| BackupError::MetadataSync(format!("download: {}", e)))?;
        let remote: MetadataRegistry = serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::MetadataSync(format!("corrupt remote registry: {}", e)))?;

        let merged = merge_registries(local, remote);
        self.save(&merged)?;
        debug!("Metadata registry synced from remote ({} entries)", merged.len());
        Ok(merged.len())
    }

    /// Write the full local registry to the remote mirror
    pub async fn sync_to_remote(&self) -> Result<()> {
        let registry = self.load()?;
        let content = serde_json::to_vec_pretty(&registry)
            .map_err(|e| BackupError::MetadataSync(e.to_string()))?;

        let result = match self.find_remote().await? {
            Some(file) => self.remote.update_file(&file.id, content, METADATA_MIME).await,
            None => {
                self.remote
                    .upload_file(&self.naming.metadata_file_name(), content, METADATA_MIME)
                    .await
            }
        };

        result
            .map(|_| ())
            .map_err(|e| BackupError::MetadataSync(format!("upload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::models::DeviceClass;
    use crate::storage::memory::{MemoryLocalStore, MemoryRemoteStorage};
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    fn descriptor(id: &str, size: u64) -> BackupDescriptor {
        BackupDescriptor {
            id: id.to_string(),
            file_name: format!("rapport-backup-{}.enc", id),
            created_at: Utc::now() - Duration::minutes(size as i64),
            size_bytes: size,
            has_attachments: false,
            attachments_file_id: None,
            origin_device_class: DeviceClass::Desktop,
            item_counts: BTreeMap::new(),
        }
    }

    fn setup() -> (Arc<MemoryLocalStore>, Arc<MemoryRemoteStorage>, MetadataStore) {
        let store = Arc::new(MemoryLocalStore::new());
        let remote = Arc::new(MemoryRemoteStorage::new());
        let metadata = MetadataStore::new(store.clone(), remote.clone(), BackupNaming::default());
        (store, remote, metadata)
    }

    #[test]
    fn test_merge_remote_wins() {
        let mut local = MetadataRegistry::new();
        local.insert("a".into(), descriptor("a", 1));
        local.insert("local-only".into(), descriptor("local-only", 2));

        let mut remote = MetadataRegistry::new();
        remote.insert("a".into(), descriptor("a", 99));
        remote.insert("remote-only".into(), descriptor("remote-only", 3));

        let merged = merge_registries(local, remote);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged["a"].size_bytes, 99);
        assert!(merged.contains_key("local-only"));
    }

    #[test]
    fn test_local_crud() {
        let (_, _, metadata) = setup();
        metadata.put(descriptor("a", 1)).unwrap();
        metadata.put(descriptor("b", 2)).unwrap();

        assert_eq!(metadata.get("a").unwrap().unwrap().size_bytes, 1);
        // Newest first
        let ids: Vec<_> = metadata.get_all().unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(metadata.delete("a").unwrap().is_some());
        assert!(metadata.delete("a").unwrap().is_none());
        assert!(metadata.get("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_to_remote_creates_then_updates() {
        let (_, remote, metadata) = setup();
        metadata.put(descriptor("a", 1)).unwrap();
        metadata.sync_to_remote().await.unwrap();
        metadata.put(descriptor("b", 2)).unwrap();
        metadata.sync_to_remote().await.unwrap();

        let mirrors: Vec<_> = remote
            .files()
            .into_iter()
            .filter(|f| f.name == "rapport-metadata.json")
            .collect();
        assert_eq!(mirrors.len(), 1);

        let stored: MetadataRegistry =
            serde_json::from_slice(&remote.content(&mirrors[0].id).unwrap()).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_sync_from_remote_merges_into_local() {
        let (_, remote, metadata) = setup();

        let mut remote_registry = MetadataRegistry::new();
        remote_registry.insert("a".into(), descriptor("a", 50));
        remote_registry.insert("r".into(), descriptor("r", 3));
        remote.insert_file(
            "rapport-metadata.json",
            serde_json::to_vec(&remote_registry).unwrap(),
            Utc::now(),
        );

        metadata.put(descriptor("a", 1)).unwrap();
        metadata.put(descriptor("l", 2)).unwrap();

        assert_eq!(metadata.sync_from_remote().await.unwrap(), 3);
        assert_eq!(metadata.get("a").unwrap().unwrap().size_bytes, 50);
        assert!(metadata.get("l").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sync_from_remote_without_mirror_keeps_local() {
        let (_, _, metadata) = setup();
        metadata.put(descriptor("a", 1)).unwrap();
        assert_eq!(metadata.sync_from_remote().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sync_failure_is_soft_kind() {
        let (_, remote, metadata) = setup();
        remote.fail_listing(true);
        let err = metadata.sync_to_remote().await.unwrap_err();
        assert!(matches!(err, BackupError::MetadataSync(_)));
        assert!(!err.is_fatal());
    }
}
