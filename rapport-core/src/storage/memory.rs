//! In-memory collaborators.
//!
//! Used by `--dev` runs of the CLI and throughout the test suite. The
//! remote store records every call and can be told to fail specific
//! operations, which is how soft-failure paths are exercised.

use crate::database::DatabaseError;
use crate::storage::{
    merge_patch, record_id, AuthProvider, Collection, CollectionData, DeviceFs, Identity,
    LocalStore, RemoteFile, RemoteStorage, StorageError,
};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use uuid::Uuid;

fn lock<'a, T>(m: &'a Mutex<T>, what: &str) -> std::result::Result<MutexGuard<'a, T>, StorageError> {
    m.lock()
        .map_err(|_| StorageError::Rejected(format!("{} lock poisoned", what)))
}

#[derive(Debug, Clone)]
struct StoredFile {
    meta: RemoteFile,
    content: Vec<u8>,
}

#[derive(Default)]
struct RemoteState {
    files: Vec<StoredFile>,
    last_modified: Option<DateTime<Utc>>,
    uploads: Vec<String>,
    fail_uploads_containing: Vec<String>,
    fail_deletes: HashSet<String>,
    fail_downloads: HashSet<String>,
    fail_listing: bool,
}

impl RemoteState {
    /// Strictly increasing modification times, so ordering is stable even
    /// when several files land within the same clock tick.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_modified {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_modified = Some(ts);
        ts
    }
}

/// Holds callers until opened
#[derive(Default)]
struct Gate(Mutex<Option<Arc<Notify>>>);

impl Gate {
    fn close(&self) {
        if let Ok(mut g) = self.0.lock() {
            *g = Some(Arc::new(Notify::new()));
        }
    }

    fn open(&self) {
        let gate = self.0.lock().ok().and_then(|mut g| g.take());
        if let Some(gate) = gate {
            // notify_one stores a permit if the caller has not started waiting yet
            gate.notify_one();
        }
    }

    async fn pass(&self, what: &str) -> std::result::Result<(), StorageError> {
        let gate = lock(&self.0, what)?.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(())
    }
}

/// Remote storage held in memory
#[derive(Default)]
pub struct MemoryRemoteStorage {
    state: Mutex<RemoteState>,
    upload_gate: Gate,
    download_gate: Gate,
}

impl MemoryRemoteStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file directly with a chosen modification time
    pub fn insert_file(&self, name: &str, content: Vec<u8>, modified: DateTime<Utc>) -> RemoteFile {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let meta = RemoteFile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            size: Some(content.len() as u64),
            created_time: modified,
            modified_time: modified,
        };
        state.files.push(StoredFile {
            meta: meta.clone(),
            content,
        });
        meta
    }

    /// Names passed to `upload_file`, in call order
    pub fn uploaded_names(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.uploads.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the stored files' metadata
    pub fn files(&self) -> Vec<RemoteFile> {
        self.state
            .lock()
            .map(|s| s.files.iter().map(|f| f.meta.clone()).collect())
            .unwrap_or_default()
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().ok().and_then(|s| {
            s.files
                .iter()
                .find(|f| f.meta.id == id)
                .map(|f| f.content.clone())
        })
    }

    /// Remove a file without going through `delete_file`
    pub fn remove(&self, id: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.files.retain(|f| f.meta.id != id);
        }
    }

    /// Make uploads whose name contains `fragment` fail
    pub fn fail_uploads_containing(&self, fragment: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_uploads_containing.push(fragment.to_string());
        }
    }

    pub fn fail_delete(&self, id: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_deletes.insert(id.to_string());
        }
    }

    pub fn fail_download(&self, id: &str) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_downloads.insert(id.to_string());
        }
    }

    pub fn fail_listing(&self, fail: bool) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_listing = fail;
        }
    }

    /// Hold uploads until `release_uploads` is called
    pub fn gate_uploads(&self) {
        self.upload_gate.close();
    }

    pub fn release_uploads(&self) {
        self.upload_gate.open();
    }

    /// Hold downloads until `release_downloads` is called
    pub fn gate_downloads(&self) {
        self.download_gate.close();
    }

    pub fn release_downloads(&self) {
        self.download_gate.open();
    }
}

#[async_trait]
impl RemoteStorage for MemoryRemoteStorage {
    async fn upload_file(
        &self,
        name: &str,
        content: Vec<u8>,
        _mime_type: &str,
    ) -> std::result::Result<RemoteFile, StorageError> {
        self.upload_gate.pass("upload gate").await?;

        let mut state = lock(&self.state, "remote")?;
        if state
            .fail_uploads_containing
            .iter()
            .any(|f| name.contains(f.as_str()))
        {
            return Err(StorageError::Rejected(format!("upload of {} refused", name)));
        }

        state.uploads.push(name.to_string());
        let ts = state.next_timestamp();
        let meta = RemoteFile {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            size: Some(content.len() as u64),
            created_time: ts,
            modified_time: ts,
        };
        state.files.push(StoredFile {
            meta: meta.clone(),
            content,
        });
        Ok(meta)
    }

    async fn download_file(&self, id: &str) -> std::result::Result<Vec<u8>, StorageError> {
        self.download_gate.pass("download gate").await?;
        let state = lock(&self.state, "remote")?;
        if state.fail_downloads.contains(id) {
            return Err(StorageError::Rejected(format!("download of {} refused", id)));
        }
        state
            .files
            .iter()
            .find(|f| f.meta.id == id)
            .map(|f| f.content.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn list_files(&self, query: &str) -> std::result::Result<Vec<RemoteFile>, StorageError> {
        let state = lock(&self.state, "remote")?;
        if state.fail_listing {
            return Err(StorageError::Rejected("listing refused".to_string()));
        }
        Ok(state
            .files
            .iter()
            .filter(|f| f.meta.name.contains(query))
            .map(|f| f.meta.clone())
            .collect())
    }

    async fn list_backups(&self) -> std::result::Result<Vec<RemoteFile>, StorageError> {
        let state = lock(&self.state, "remote")?;
        if state.fail_listing {
            return Err(StorageError::Rejected("listing refused".to_string()));
        }
        Ok(state.files.iter().map(|f| f.meta.clone()).collect())
    }

    async fn update_file(
        &self,
        id: &str,
        content: Vec<u8>,
        _mime_type: &str,
    ) -> std::result::Result<RemoteFile, StorageError> {
        let mut state = lock(&self.state, "remote")?;
        let ts = state.next_timestamp();
        let file = state
            .files
            .iter_mut()
            .find(|f| f.meta.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        file.meta.size = Some(content.len() as u64);
        file.meta.modified_time = ts;
        file.content = content;
        Ok(file.meta.clone())
    }

    async fn delete_file(&self, id: &str) -> std::result::Result<(), StorageError> {
        let mut state = lock(&self.state, "remote")?;
        if state.fail_deletes.contains(id) {
            return Err(StorageError::Rejected(format!("delete of {} refused", id)));
        }
        let before = state.files.len();
        state.files.retain(|f| f.meta.id != id);
        if state.files.len() == before {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }
}

/// Local data store held in memory
#[derive(Default)]
pub struct MemoryLocalStore {
    records: Mutex<BTreeMap<Collection, Vec<Value>>>,
    settings: Mutex<HashMap<String, String>>,
    imports: Mutex<usize>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to a collection
    pub fn insert(&self, collection: Collection, record: Value) {
        if let Ok(mut records) = self.records.lock() {
            records.entry(collection).or_default().push(record);
        }
    }

    /// How many times `import_data` has run
    pub fn import_count(&self) -> usize {
        self.imports.lock().map(|n| *n).unwrap_or(0)
    }

    fn poisoned(what: &str) -> crate::BackupError {
        DatabaseError::LockPoisoned(what.to_string()).into()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let records = self.records.lock().map_err(|_| Self::poisoned("records"))?;
        Ok(records.get(&collection).cloned().unwrap_or_default())
    }

    fn get_by_id(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        let records = self.records.lock().map_err(|_| Self::poisoned("records"))?;
        Ok(records
            .get(&collection)
            .and_then(|rs| rs.iter().find(|r| record_id(r).as_deref() == Some(id)))
            .cloned())
    }

    fn update(&self, collection: Collection, id: &str, patch: &Value) -> Result<bool> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned("records"))?;
        let found = records
            .get_mut(&collection)
            .and_then(|rs| rs.iter_mut().find(|r| record_id(r).as_deref() == Some(id)));
        match found {
            Some(record) => {
                merge_patch(record, patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn import_data(&self, data: &CollectionData, replace: bool) -> Result<()> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned("records"))?;
        if replace {
            records.clear();
        }
        for (collection, incoming) in data {
            let existing = records.entry(*collection).or_default();
            for record in incoming {
                let id = record_id(record);
                match existing
                    .iter_mut()
                    .find(|r| id.is_some() && record_id(r) == id)
                {
                    Some(slot) => *slot = record.clone(),
                    None => existing.push(record.clone()),
                }
            }
        }
        *self.imports.lock().map_err(|_| Self::poisoned("imports"))? += 1;
        Ok(())
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let settings = self.settings.lock().map_err(|_| Self::poisoned("settings"))?;
        Ok(settings.get(key).cloned())
    }

    fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut settings = self.settings.lock().map_err(|_| Self::poisoned("settings"))?;
        settings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Device filesystem held in memory
#[derive(Default)]
pub struct MemoryDeviceFs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fail_writes: Mutex<HashSet<String>>,
}

impl MemoryDeviceFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: &str, bytes: &[u8]) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.to_string(), bytes.to_vec());
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().ok().and_then(|f| f.get(path).cloned())
    }

    pub fn clear(&self) {
        if let Ok(mut files) = self.files.lock() {
            files.clear();
        }
    }

    pub fn fail_write(&self, path: &str) {
        if let Ok(mut fail) = self.fail_writes.lock() {
            fail.insert(path.to_string());
        }
    }
}

fn io_poisoned() -> std::io::Error {
    std::io::Error::other("device fs lock poisoned")
}

#[async_trait]
impl DeviceFs for MemoryDeviceFs {
    async fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>> {
        let files = self.files.lock().map_err(|_| io_poisoned())?;
        files.get(path).cloned().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{} not found", path))
        })
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> std::io::Result<()> {
        if self.fail_writes.lock().map_err(|_| io_poisoned())?.contains(path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", path),
            ));
        }
        let mut files = self.files.lock().map_err(|_| io_poisoned())?;
        files.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }
}

/// Auth provider with a settable identity
#[derive(Default)]
pub struct StaticAuth {
    identity: Mutex<Option<Identity>>,
}

impl StaticAuth {
    pub fn signed_in(account_id: &str) -> Self {
        Self {
            identity: Mutex::new(Some(Identity::new(account_id))),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set(&self, identity: Option<Identity>) {
        if let Ok(mut current) = self.identity.lock() {
            *current = identity;
        }
    }
}

impl AuthProvider for StaticAuth {
    fn current_identity(&self) -> Option<Identity> {
        self.identity.lock().ok().and_then(|i| i.clone())
    }
}
