//! Bootstrap storage handlers.
//!
//! Storage is only touched while the process starts: reading the
//! configuration and writing a template on `init`.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// File existence, read and write primitives.
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// Whether an item exists at `path`.
    async fn exists(&self, path: &Path) -> bool;

    /// Read the whole item as UTF-8 text.
    async fn read(&self, path: &Path) -> StorageResult<String>;

    /// Replace the item with `contents`, creating parents as needed.
    async fn write(&self, path: &Path, contents: &str) -> StorageResult<()>;
}

/// Storage backed by the local file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStorage;

impl FileStorage {
    /// Create a file storage handler.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StorageHandler for FileStorage {
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn read(&self, path: &Path) -> StorageResult<String> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, path: &Path, contents: &str) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write to a sibling first so a crash never leaves a torn file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "wrote file");
        Ok(())
    }
}

/// In-memory storage, mostly for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<PathBuf, String>>,
}

impl MemoryStorage {
    /// Create an empty memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageHandler for MemoryStorage {
    async fn exists(&self, path: &Path) -> bool {
        self.files.read().await.contains_key(path)
    }

    async fn read(&self, path: &Path) -> StorageResult<String> {
        self.files
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(path.display().to_string()))
    }

    async fn write(&self, path: &Path, contents: &str) -> StorageResult<()> {
        self.files
            .write()
            .await
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }
}
