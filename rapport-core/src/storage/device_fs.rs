//! Device filesystem rooted at a local directory.

use crate::storage::DeviceFs;
use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};

/// `DeviceFs` over `tokio::fs`, confined to a root directory.
///
/// Attachment paths are relative to the root. Absolute paths and parent
/// components are rejected so an archive cannot write outside it.
pub struct LocalDeviceFs {
    root: PathBuf,
}

impl LocalDeviceFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let relative = Path::new(path);
        let confined = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

        if !confined {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Path escapes attachment root: {}", path),
            ));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl DeviceFs for LocalDeviceFs {
    async fn read_file(&self, path: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.resolve(path)?).await
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, bytes).await
    }
}
