//! Collaborator capabilities consumed by the backup pipeline.
//!
//! The pipeline never talks to a concrete store, network API or
//! filesystem directly; each is injected behind one of these traits.

pub mod device_fs;
pub mod drive;
pub mod memory;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

pub use device_fs::LocalDeviceFs;
pub use drive::DriveClient;

/// Errors raised by the remote storage capability
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Remote file not found: {0}")]
    NotFound(String),

    #[error("Remote storage rejected credentials")]
    Unauthorized,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

/// A file as listed by remote storage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: Option<u64>,
    pub created_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
}

/// Remote file-storage capability.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    async fn upload_file(
        &self,
        name: &str,
        content: Vec<u8>,
        mime_type: &str,
    ) -> std::result::Result<RemoteFile, StorageError>;

    async fn download_file(&self, id: &str) -> std::result::Result<Vec<u8>, StorageError>;

    /// Files whose name contains `query`
    async fn list_files(&self, query: &str) -> std::result::Result<Vec<RemoteFile>, StorageError>;

    /// Every file in the application's backup space
    async fn list_backups(&self) -> std::result::Result<Vec<RemoteFile>, StorageError>;

    async fn update_file(
        &self,
        id: &str,
        content: Vec<u8>,
        mime_type: &str,
    ) -> std::result::Result<RemoteFile, StorageError>;

    async fn delete_file(&self, id: &str) -> std::result::Result<(), StorageError>;
}

/// Device filesystem capability (present on mobile builds only).
#[async_trait]
pub trait DeviceFs: Send + Sync {
    async fn read_file(&self, path: &str) -> std::io::Result<Vec<u8>>;

    async fn write_file(&self, path: &str, bytes: &[u8]) -> std::io::Result<()>;
}

/// Record collections held by the local data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Clients,
    Appointments,
    Tasks,
    Calendars,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Clients,
        Collection::Appointments,
        Collection::Tasks,
        Collection::Calendars,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clients => "clients",
            Self::Appointments => "appointments",
            Self::Tasks => "tasks",
            Self::Calendars => "calendars",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clients" => Some(Self::Clients),
            "appointments" => Some(Self::Appointments),
            "tasks" => Some(Self::Tasks),
            "calendars" => Some(Self::Calendars),
            _ => None,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full contents of the local store, keyed by collection.
pub type CollectionData = BTreeMap<Collection, Vec<Value>>;

/// Local data store capability.
///
/// Records are schemaless JSON documents identified by their `id` field.
/// Settings are opaque strings used for small durable values such as the
/// backup metadata registry.
pub trait LocalStore: Send + Sync {
    fn get_all(&self, collection: Collection) -> Result<Vec<Value>>;

    fn get_by_id(&self, collection: Collection, id: &str) -> Result<Option<Value>>;

    /// Shallow-merge `patch` into the record. Returns false if no such record.
    fn update(&self, collection: Collection, id: &str, patch: &Value) -> Result<bool>;

    /// Load `data` into the store. With `replace`, every collection is
    /// emptied first; otherwise records are upserted by id.
    fn import_data(&self, data: &CollectionData, replace: bool) -> Result<()>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;

    fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// The signed-in account as seen by the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: String,
}

impl Identity {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
        }
    }
}

/// Source of the currently authenticated remote-storage identity.
pub trait AuthProvider: Send + Sync {
    fn current_identity(&self) -> Option<Identity>;
}

/// Extract the `id` of a record as a string (string or numeric ids).
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Shallow JSON merge used by `LocalStore::update` implementations.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    if let (Value::Object(target), Value::Object(patch)) = (target, patch) {
        for (k, v) in patch {
            target.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collection_roundtrip() {
        for c in Collection::ALL {
            assert_eq!(Collection::parse(c.as_str()), Some(c));
        }
        assert_eq!(Collection::parse("invoices"), None);
    }

    #[test]
    fn record_id_accepts_strings_and_numbers() {
        assert_eq!(record_id(&json!({"id": "c-1"})), Some("c-1".to_string()));
        assert_eq!(record_id(&json!({"id": 42})), Some("42".to_string()));
        assert_eq!(record_id(&json!({"id": ""})), None);
        assert_eq!(record_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn merge_patch_is_shallow() {
        let mut record = json!({"id": "1", "name": "Ada", "tags": ["a"]});
        merge_patch(&mut record, &json!({"name": "Ada L.", "tags": []}));
        assert_eq!(record, json!({"id": "1", "name": "Ada L.", "tags": []}));
    }
}
