use super::{StorageBackend, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

/// In-process object store, used for tests and local development
#[derive(Clone)]
pub struct MemoryBackend {
    name: String,
    objects: Arc<DashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Arc::new(DashMap::new()),
        }
    }

    /// Raw object bytes, if present
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    /// Place bytes directly, bypassing upload
    pub fn put_object(&self, key: impl Into<String>, data: Vec<u8>) {
        self.objects.insert(key.into(), data);
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.contains_key(key))
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().len() as u64)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn upload(&self, local_file: &Path, key: &str) -> Result<bool, StorageError> {
        let data = fs::read(local_file).await.map_err(|e| StorageError::Io {
            backend: self.name.clone(),
            message: format!("Failed to read {}: {}", local_file.display(), e),
        })?;
        self.objects.insert(key.to_string(), data);
        Ok(true)
    }

    async fn download(&self, key: &str, local_file: &Path) -> Result<bool, StorageError> {
        let Some(data) = self.object(key) else {
            return Ok(false);
        };
        fs::write(local_file, data).await.map_err(|e| StorageError::Io {
            backend: self.name.clone(),
            message: format!("Failed to write {}: {}", local_file.display(), e),
        })?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.remove(key).is_some())
    }
}
