//! Google Drive v3 client scoped to the application data folder.

use crate::storage::{RemoteFile, RemoteStorage, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use zeroize::Zeroizing;

pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

const SPACE: &str = "appDataFolder";
const FILE_FIELDS: &str = "id,name,size,createdTime,modifiedTime";
const BOUNDARY: &str = "rapport-multipart-boundary";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    /// Drive reports sizes as decimal strings
    size: Option<String>,
    created_time: DateTime<Utc>,
    modified_time: DateTime<Utc>,
}

impl From<DriveFile> for RemoteFile {
    fn from(f: DriveFile) -> Self {
        RemoteFile {
            id: f.id,
            name: f.name,
            size: f.size.and_then(|s| s.parse().ok()),
            created_time: f.created_time,
            modified_time: f.modified_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// HTTP client for Drive's appDataFolder space.
pub struct DriveClient {
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    token: Zeroizing<String>,
}

impl DriveClient {
    /// Create a new client with a bearer token.
    pub fn new(api_base: &str, upload_base: &str, token: &str) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| StorageError::Http(e.to_string()))?;

        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            upload_base: upload_base.trim_end_matches('/').to_string(),
            token: Zeroizing::new(token.to_string()),
        })
    }

    async fn list_query(&self, q: &str) -> Result<Vec<RemoteFile>, StorageError> {
        let url = format!("{}/files", self.api_base);
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(self.token.as_str())
                .query(&[("q", q), ("spaces", SPACE), ("fields", fields.as_str())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let resp = request.send().await.map_err(http_error)?;
            let page: FileList = parse_json(check_status(resp).await?).await?;
            files.extend(page.files.into_iter().map(RemoteFile::from));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(files)
    }
}

#[async_trait]
impl RemoteStorage for DriveClient {
    async fn upload_file(
        &self,
        name: &str,
        content: Vec<u8>,
        mime_type: &str,
    ) -> Result<RemoteFile, StorageError> {
        let metadata = serde_json::json!({ "name": name, "parents": [SPACE] });
        let body = multipart_related(&metadata, &content, mime_type);
        let url = format!("{}/files", self.upload_base);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.token.as_str())
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(
                "Content-Type",
                format!("multipart/related; boundary={}", BOUNDARY),
            )
            .body(body)
            .send()
            .await
            .map_err(http_error)?;

        let file: DriveFile = parse_json(check_status(resp).await?).await?;
        Ok(file.into())
    }

    async fn download_file(&self, id: &str) -> Result<Vec<u8>, StorageError> {
        let url = format!("{}/files/{}", self.api_base, id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.token.as_str())
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(http_error)?;

        let resp = check_status(resp).await.map_err(|e| match e {
            StorageError::NotFound(_) => StorageError::NotFound(id.to_string()),
            other => other,
        })?;
        let bytes = resp.bytes().await.map_err(http_error)?;
        Ok(bytes.to_vec())
    }

    async fn list_files(&self, query: &str) -> Result<Vec<RemoteFile>, StorageError> {
        let q = format!(
            "name contains '{}' and trashed = false",
            escape_query(query)
        );
        self.list_query(&q).await
    }

    async fn list_backups(&self) -> Result<Vec<RemoteFile>, StorageError> {
        self.list_query("trashed = false").await
    }

    async fn update_file(
        &self,
        id: &str,
        content: Vec<u8>,
        mime_type: &str,
    ) -> Result<RemoteFile, StorageError> {
        let url = format!("{}/files/{}", self.upload_base, id);
        let resp = self
            .client
            .patch(&url)
            .bearer_auth(self.token.as_str())
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header("Content-Type", mime_type)
            .body(content)
            .send()
            .await
            .map_err(http_error)?;

        let file: DriveFile = parse_json(check_status(resp).await?).await?;
        Ok(file.into())
    }

    async fn delete_file(&self, id: &str) -> Result<(), StorageError> {
        let url = format!("{}/files/{}", self.api_base, id);
        let resp = self
            .client
            .delete(&url)
            .bearer_auth(self.token.as_str())
            .send()
            .await
            .map_err(http_error)?;

        check_status(resp).await?;
        Ok(())
    }
}

// --- Internal helpers ---

fn http_error(e: reqwest::Error) -> StorageError {
    StorageError::Http(e.to_string())
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StorageError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
    Err(match status.as_u16() {
        401 => StorageError::Unauthorized,
        404 => StorageError::NotFound(body),
        code => StorageError::Status { status: code, body },
    })
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, StorageError> {
    let bytes = resp.bytes().await.map_err(http_error)?;
    serde_json::from_slice(&bytes).map_err(|e| StorageError::InvalidResponse(e.to_string()))
}

/// Escape a literal for use inside a single-quoted Drive query string
fn escape_query(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn multipart_related(metadata: &serde_json::Value, content: &[u8], mime_type: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(content.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}
