//! Storage backends for backup artifacts
//!
//! Every backup is written to exactly three locations: local disk and two
//! independent object stores. Each location is bound to a [`StorageBackend`]
//! implementation and every call goes through [`StorageSet`], which bounds it
//! with a timeout so a hung backend fails over instead of blocking a job.

pub mod failover;
pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

pub use failover::{download_with_failover, AttemptState, DownloadOutcome, FailoverPlan};
pub use local::LocalBackend;
pub use memory::MemoryBackend;
#[cfg(feature = "s3")]
pub use s3::{S3Backend, S3Config};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::ledger::BackupType;

/// Errors raised by a single backend call
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("IO error on {backend}: {message}")]
    Io { backend: String, message: String },

    #[error("Remote error on {backend}: {message}")]
    Remote { backend: String, message: String },

    #[error("{backend} did not answer within {after:?}")]
    Timeout { backend: String, after: Duration },
}

/// The three places a backup can live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    Local,
    Primary,
    Secondary,
}

impl StorageLocation {
    /// All locations, in upload order
    pub const ALL: [StorageLocation; 3] = [Self::Local, Self::Primary, Self::Secondary];

    /// Download preference: object stores first, local disk last
    pub const DOWNLOAD_ORDER: [StorageLocation; 3] = [Self::Primary, Self::Secondary, Self::Local];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    pub fn is_cloud(&self) -> bool {
        !matches!(self, Self::Local)
    }

    /// Locations a backup of the given type is expected to occupy.
    /// WAL archives skip local disk.
    pub fn expected_for(backup_type: BackupType) -> &'static [StorageLocation] {
        match backup_type {
            BackupType::WalArchive => &[Self::Primary, Self::Secondary],
            _ => &Self::ALL,
        }
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform capability set over a storage backend.
///
/// Implementations make a single attempt per call; timeouts, retries and
/// failover are the caller's job.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and error messages
    fn name(&self) -> &str;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn size(&self, key: &str) -> Result<u64, StorageError>;

    async fn upload(&self, local_file: &Path, key: &str) -> Result<bool, StorageError>;

    async fn download(&self, key: &str, local_file: &Path) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<bool, StorageError>;
}

/// The closed set of three backends, one per [`StorageLocation`]
#[derive(Clone)]
pub struct StorageSet {
    local: Arc<dyn StorageBackend>,
    primary: Arc<dyn StorageBackend>,
    secondary: Arc<dyn StorageBackend>,
    call_timeout: Duration,
}

impl StorageSet {
    pub fn new(
        local: Arc<dyn StorageBackend>,
        primary: Arc<dyn StorageBackend>,
        secondary: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            local,
            primary,
            secondary,
            call_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn backend(&self, location: StorageLocation) -> &Arc<dyn StorageBackend> {
        match location {
            StorageLocation::Local => &self.local,
            StorageLocation::Primary => &self.primary,
            StorageLocation::Secondary => &self.secondary,
        }
    }

    async fn bounded<T, F>(&self, location: StorageLocation, call: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                backend: self.backend(location).name().to_string(),
                after: self.call_timeout,
            }),
        }
    }

    pub async fn exists(&self, location: StorageLocation, key: &str) -> Result<bool, StorageError> {
        self.bounded(location, self.backend(location).exists(key)).await
    }

    pub async fn size(&self, location: StorageLocation, key: &str) -> Result<u64, StorageError> {
        self.bounded(location, self.backend(location).size(key)).await
    }

    pub async fn upload(
        &self,
        location: StorageLocation,
        local_file: &Path,
        key: &str,
    ) -> Result<bool, StorageError> {
        self.bounded(location, self.backend(location).upload(local_file, key))
            .await
    }

    pub async fn download(
        &self,
        location: StorageLocation,
        key: &str,
        local_file: &Path,
    ) -> Result<bool, StorageError> {
        self.bounded(location, self.backend(location).download(key, local_file))
            .await
    }

    pub async fn delete(&self, location: StorageLocation, key: &str) -> Result<bool, StorageError> {
        self.bounded(location, self.backend(location).delete(key)).await
    }
}

/// Object key for a backup artifact, shared by all three locations
pub fn object_key(backup_type: BackupType, filename: &str) -> String {
    format!("backups/{}/{}", backup_type.as_str().to_lowercase(), filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowBackend;

    #[async_trait]
    impl StorageBackend for SlowBackend {
        fn name(&self) -> &str {
            "slow"
        }

        async fn exists(&self, _key: &str) -> Result<bool, StorageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(true)
        }

        async fn size(&self, _key: &str) -> Result<u64, StorageError> {
            Ok(0)
        }

        async fn upload(&self, _local_file: &Path, _key: &str) -> Result<bool, StorageError> {
            Ok(true)
        }

        async fn download(&self, _key: &str, _local_file: &Path) -> Result<bool, StorageError> {
            Ok(true)
        }

        async fn delete(&self, _key: &str) -> Result<bool, StorageError> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_hung_backend_times_out() {
        let set = StorageSet::new(
            Arc::new(MemoryBackend::new("local")),
            Arc::new(SlowBackend),
            Arc::new(MemoryBackend::new("secondary")),
        )
        .with_call_timeout(Duration::from_millis(20));

        let result = set.exists(StorageLocation::Primary, "backups/x").await;
        assert!(matches!(result, Err(StorageError::Timeout { .. })));
    }

    #[test]
    fn test_wal_archives_skip_local() {
        let expected = StorageLocation::expected_for(BackupType::WalArchive);
        assert!(!expected.contains(&StorageLocation::Local));
        assert_eq!(StorageLocation::expected_for(BackupType::FullDatabase).len(), 3);
    }

    #[test]
    fn test_object_key_layout() {
        assert_eq!(
            object_key(BackupType::TenantBackup, "t.dump.gz.enc"),
            "backups/tenant_backup/t.dump.gz.enc"
        );
    }
}
