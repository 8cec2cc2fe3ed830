// Local disk backend - copies artifacts under a root directory

use super::{StorageBackend, StorageError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key under the root, refusing anything that would escape it
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn io_error(&self, message: String) -> StorageError {
        StorageError::Io {
            backend: self.name().to_string(),
            message,
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| self.io_error(format!("Failed to stat {}: {}", path.display(), e)))
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key.to_string())),
            Err(e) => Err(self.io_error(format!("Failed to stat {}: {}", path.display(), e))),
        }
    }

    async fn upload(&self, local_file: &Path, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(format!("Failed to create backup directory: {}", e)))?;
        }

        fs::copy(local_file, &path)
            .await
            .map_err(|e| self.io_error(format!("Failed to copy into {}: {}", path.display(), e)))?;
        Ok(true)
    }

    async fn download(&self, key: &str, local_file: &Path) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match fs::copy(&path, local_file).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(format!("Failed to read {}: {}", path.display(), e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(format!("Failed to delete {}: {}", path.display(), e))),
        }
    }
}
