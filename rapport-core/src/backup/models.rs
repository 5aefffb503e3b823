//! Backup data model.

use crate::storage::{Collection, CollectionData};
use crate::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Current plaintext payload format
pub const PAYLOAD_VERSION: u32 = 1;

/// Kind of device a backup was made on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Desktop,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mobile => "mobile",
            Self::Desktop => "desktop",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed backup.
///
/// `id` is the remote file id of the main payload. A descriptor is only
/// created once that upload has succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupDescriptor {
    pub id: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub has_attachments: bool,
    /// Remote id of the paired attachments archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments_file_id: Option<String>,
    pub origin_device_class: DeviceClass,
    #[serde(default)]
    pub item_counts: BTreeMap<String, usize>,
}

/// Where to find the attachments archive paired with a main backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentLink {
    /// The backup was made without attachments
    Absent,
    /// Remote id recorded on the descriptor
    Linked(String),
    /// No usable link; match the archive by date token
    ByDate,
}

impl AttachmentLink {
    /// A descriptor is authoritative. Only a missing descriptor, or a legacy
    /// one with attachments but no recorded id, falls back to the date token.
    pub fn resolve(descriptor: Option<&BackupDescriptor>) -> Self {
        match descriptor {
            None => Self::ByDate,
            Some(d) if !d.has_attachments => Self::Absent,
            Some(d) => match &d.attachments_file_id {
                Some(id) => Self::Linked(id.clone()),
                None => Self::ByDate,
            },
        }
    }
}

/// Descriptors keyed by id
pub type MetadataRegistry = BTreeMap<String, BackupDescriptor>;

/// Plaintext sealed inside the main envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPayload {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub device_class: Option<DeviceClass>,
    #[serde(default)]
    pub includes_photos: bool,
    pub data: BTreeMap<String, Value>,
}

impl BackupPayload {
    pub fn new(
        data: &CollectionData,
        device_class: DeviceClass,
        includes_photos: bool,
        created_at: DateTime<Utc>,
    ) -> Self {
        let data = data
            .iter()
            .map(|(c, records)| (c.as_str().to_string(), Value::Array(records.clone())))
            .collect();

        Self {
            version: PAYLOAD_VERSION,
            created_at,
            device_class: Some(device_class),
            includes_photos,
            data,
        }
    }

    /// Parse and structurally validate decrypted payload text.
    ///
    /// Requires `version`, `createdAt` and `data`, with `data.clients`
    /// present. Every known collection that appears must be an array.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| BackupError::Validation(format!("payload is not JSON: {}", e)))?;
        validate_structure(&value)?;
        serde_json::from_value(value).map_err(|e| BackupError::Validation(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BackupError::Validation(e.to_string()))
    }

    /// Known collections as store input. Unknown keys are ignored.
    pub fn collection_data(&self) -> CollectionData {
        Collection::ALL
            .iter()
            .filter_map(|c| match self.data.get(c.as_str()) {
                Some(Value::Array(records)) => Some((*c, records.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn item_counts(&self) -> BTreeMap<String, usize> {
        item_counts(&self.collection_data())
    }
}

fn validate_structure(value: &Value) -> Result<()> {
    let obj = value
        .as_object()
        .ok_or_else(|| BackupError::Validation("payload is not an object".into()))?;

    for field in ["version", "createdAt", "data"] {
        if !obj.contains_key(field) {
            return Err(BackupError::Validation(format!("missing field `{}`", field)));
        }
    }

    let data = obj["data"]
        .as_object()
        .ok_or_else(|| BackupError::Validation("`data` is not an object".into()))?;

    if !data.contains_key(Collection::Clients.as_str()) {
        return Err(BackupError::Validation("missing collection `clients`".into()));
    }

    for collection in Collection::ALL {
        if let Some(v) = data.get(collection.as_str()) {
            if !v.is_array() {
                return Err(BackupError::Validation(format!(
                    "collection `{}` is not an array",
                    collection
                )));
            }
        }
    }

    Ok(())
}

pub fn item_counts(data: &CollectionData) -> BTreeMap<String, usize> {
    data.iter()
        .map(|(c, records)| (c.as_str().to_string(), records.len()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStorage {
    Device,
    #[default]
    Inline,
}

/// Entry of a record's `attachments` array
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachmentRef {
    pub id: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub storage: AttachmentStorage,
    pub path: Option<String>,
    /// Inline payload, already part of the main data
    pub data: Option<String>,
}

impl AttachmentRef {
    /// Device path when the bytes live on the device filesystem
    pub fn device_path(&self) -> Option<&str> {
        match (self.storage, self.path.as_deref()) {
            (AttachmentStorage::Device, Some(path)) if !path.is_empty() => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SoftFailureKind {
    Attachment,
    MetadataSync,
    Retention,
    Delete,
}

/// A best-effort step that failed without aborting its operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftFailure {
    pub kind: SoftFailureKind,
    pub reason: String,
}

impl SoftFailure {
    pub fn new(kind: SoftFailureKind, reason: impl fmt::Display) -> Self {
        Self {
            kind,
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for SoftFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

/// Result of a best-effort stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Completed,
    SoftFailure(SoftFailure),
}

impl StageOutcome {
    pub fn from_result<T, E: fmt::Display>(
        kind: SoftFailureKind,
        result: std::result::Result<T, E>,
    ) -> Self {
        match result {
            Ok(_) => Self::Completed,
            Err(e) => Self::SoftFailure(SoftFailure::new(kind, e)),
        }
    }

    /// Push a soft failure onto `into`, logging it
    pub fn record(self, into: &mut Vec<SoftFailure>) {
        if let Self::SoftFailure(failure) = self {
            tracing::warn!("{}", failure);
            into.push(failure);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupReport {
    pub success: bool,
    pub file_id: String,
    pub file_name: String,
    pub has_attachments: bool,
    pub attachments_file_id: Option<String>,
    pub item_counts: BTreeMap<String, usize>,
    pub soft_failures: Vec<SoftFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub success: bool,
    pub backup_id: String,
    pub item_counts: BTreeMap<String, usize>,
    pub attachments_restored: usize,
    pub reload_scheduled: bool,
    pub soft_failures: Vec<SoftFailure>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    pub backup_id: String,
    pub attachments_deleted: Option<String>,
    pub soft_failures: Vec<SoftFailure>,
}

/// A remote main backup joined with its local descriptor
#[derive(Debug, Clone, Serialize)]
pub struct BackupListing {
    pub id: String,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    /// `mobile`, `desktop` or `unknown` when no descriptor exists
    pub device_type: String,
    pub has_attachments: bool,
    pub item_counts: BTreeMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_json_is_camel_case() {
        let descriptor = BackupDescriptor {
            id: "f1".into(),
            file_name: "rapport-backup-2024-01-01.enc".into(),
            created_at: Utc::now(),
            size_bytes: 10,
            has_attachments: false,
            attachments_file_id: None,
            origin_device_class: DeviceClass::Mobile,
            item_counts: BTreeMap::new(),
        };
        let v = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(v["fileName"], "rapport-backup-2024-01-01.enc");
        assert_eq!(v["originDeviceClass"], "mobile");
        assert!(v.get("attachmentsFileId").is_none());
    }

    #[test]
    fn test_payload_roundtrip_keeps_collections() {
        let mut data = CollectionData::new();
        data.insert(Collection::Clients, vec![json!({"id": "c1"}), json!({"id": "c2"})]);
        data.insert(Collection::Tasks, vec![]);

        let payload = BackupPayload::new(&data, DeviceClass::Desktop, true, Utc::now());
        let parsed = BackupPayload::parse(&payload.to_json().unwrap()).unwrap();

        assert_eq!(parsed.collection_data(), data);
        assert_eq!(parsed.item_counts()["clients"], 2);
    }

    #[test]
    fn test_validation_requires_top_level_fields() {
        let missing_data = json!({"version": 1, "createdAt": "2024-01-01T00:00:00Z"});
        assert!(BackupPayload::parse(&missing_data.to_string()).is_err());

        let missing_clients = json!({
            "version": 1, "createdAt": "2024-01-01T00:00:00Z", "data": {"tasks": []}
        });
        assert!(BackupPayload::parse(&missing_clients.to_string()).is_err());

        let not_array = json!({
            "version": 1, "createdAt": "2024-01-01T00:00:00Z",
            "data": {"clients": [], "appointments": {"a": 1}}
        });
        let err = BackupPayload::parse(&not_array.to_string()).unwrap_err();
        assert!(matches!(err, BackupError::Validation(_)));
    }

    #[test]
    fn test_unknown_collections_are_ignored() {
        let payload = json!({
            "version": 1, "createdAt": "2024-01-01T00:00:00Z",
            "data": {"clients": [], "invoices": "legacy"}
        });
        let parsed = BackupPayload::parse(&payload.to_string()).unwrap();
        assert_eq!(parsed.collection_data().len(), 1);
    }

    #[test]
    fn test_attachment_ref_device_path() {
        let device: AttachmentRef =
            serde_json::from_value(json!({"storage": "device", "path": "a/b.jpg"})).unwrap();
        assert_eq!(device.device_path(), Some("a/b.jpg"));

        let empty: AttachmentRef =
            serde_json::from_value(json!({"storage": "device", "path": ""})).unwrap();
        assert_eq!(empty.device_path(), None);

        let inline: AttachmentRef =
            serde_json::from_value(json!({"storage": "inline", "data": "aGk="})).unwrap();
        assert_eq!(inline.device_path(), None);
    }

    fn descriptor(has_attachments: bool, attachments_file_id: Option<&str>) -> BackupDescriptor {
        BackupDescriptor {
            id: "m1".into(),
            file_name: "rapport-backup-2024-03-05T10-00-00Z.enc".into(),
            created_at: Utc::now(),
            size_bytes: 10,
            has_attachments,
            attachments_file_id: attachments_file_id.map(String::from),
            origin_device_class: DeviceClass::Mobile,
            item_counts: BTreeMap::new(),
        }
    }

    #[test]
    fn test_attachment_link_trusts_descriptor() {
        assert_eq!(AttachmentLink::resolve(None), AttachmentLink::ByDate);
        assert_eq!(
            AttachmentLink::resolve(Some(&descriptor(false, None))),
            AttachmentLink::Absent
        );
        assert_eq!(
            AttachmentLink::resolve(Some(&descriptor(true, Some("a1")))),
            AttachmentLink::Linked("a1".into())
        );
        assert_eq!(
            AttachmentLink::resolve(Some(&descriptor(true, None))),
            AttachmentLink::ByDate
        );
    }

    #[test]
    fn test_stage_outcome_records_failures() {
        let mut failures = Vec::new();
        StageOutcome::from_result::<(), &str>(SoftFailureKind::Retention, Ok(())).record(&mut failures);
        StageOutcome::from_result::<(), &str>(SoftFailureKind::Retention, Err("boom")).record(&mut failures);
        assert_eq!(failures, vec![SoftFailure::new(SoftFailureKind::Retention, "boom")]);
    }
}
