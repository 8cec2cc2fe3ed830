// S3 object store backend
// Works against AWS S3 or any S3-compatible service (MinIO, LocalStack, R2)

use super::{StorageBackend, StorageError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_types::region::Region;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// S3 rejects parts below 5 MiB, except the last one
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Connection settings for one object store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub key_prefix: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    /// Files at least this large go up as multipart uploads
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    #[serde(default = "default_part_size")]
    pub part_size_bytes: u64,
}

fn default_multipart_threshold() -> u64 {
    64 * 1024 * 1024
}

fn default_part_size() -> u64 {
    16 * 1024 * 1024
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket_name: "platform-backups".to_string(),
            region: "us-east-1".to_string(),
            key_prefix: String::new(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_bytes: default_multipart_threshold(),
            part_size_bytes: default_part_size(),
        }
    }
}

pub struct S3Backend {
    name: String,
    client: Client,
    config: S3Config,
}

impl S3Backend {
    /// Build a client for the given store. `name` distinguishes the primary
    /// and secondary stores in logs.
    pub async fn new(name: impl Into<String>, config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        // Support for LocalStack/MinIO with custom endpoint
        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self {
            name: name.into(),
            client: Client::from_conf(builder.build()),
            config,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn remote_error(&self, message: String) -> StorageError {
        StorageError::Remote {
            backend: self.name.clone(),
            message,
        }
    }

    fn io_error(&self, message: String) -> StorageError {
        StorageError::Io {
            backend: self.name.clone(),
            message,
        }
    }

    async fn put_single(&self, local_file: &Path, key: &str) -> Result<(), StorageError> {
        let body = ByteStream::from_path(local_file)
            .await
            .map_err(|e| self.io_error(format!("Failed to open {}: {}", local_file.display(), e)))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(self.full_key(key))
            .body(body)
            .send()
            .await
            .map_err(|e| self.remote_error(format!("Failed to upload object: {}", e)))?;
        Ok(())
    }

    /// Multipart upload streamed from disk one part at a time. A failed
    /// upload is aborted so no parts are left behind.
    async fn put_multipart(&self, local_file: &Path, key: &str, size: u64) -> Result<(), StorageError> {
        let full_key = self.full_key(key);
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| self.remote_error(format!("Failed to start multipart upload: {}", e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| self.remote_error("multipart upload has no id".to_string()))?
            .to_string();

        let parts = match self.put_parts(local_file, &full_key, &upload_id, size).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart(&full_key, &upload_id).await;
                return Err(e);
            }
        };
        let part_count = parts.len();

        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(&full_key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
        {
            self.abort_multipart(&full_key, &upload_id).await;
            return Err(self.remote_error(format!("Failed to complete multipart upload: {}", e)));
        }
        debug!(backend = %self.name, key = key, parts = part_count, "multipart upload completed");
        Ok(())
    }

    async fn put_parts(
        &self,
        local_file: &Path,
        full_key: &str,
        upload_id: &str,
        size: u64,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let part_size = self.config.part_size_bytes.max(MIN_PART_SIZE);
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < size {
            let length = part_size.min(size - offset);
            let body = ByteStream::read_from()
                .path(local_file)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| self.io_error(format!("Failed to read {}: {}", local_file.display(), e)))?;

            let response = self
                .client
                .upload_part()
                .bucket(&self.config.bucket_name)
                .key(full_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| self.remote_error(format!("Failed to upload part {}: {}", part_number, e)))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(response.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            offset += length;
            part_number += 1;
        }
        Ok(parts)
    }

    async fn abort_multipart(&self, full_key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(full_key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(backend = %self.name, key = full_key, error = %e, "Failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(self.remote_error(format!("Failed to check existence: {}", service_error)))
                }
            }
        }
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let response = self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    StorageError::NotFound(key.to_string())
                } else {
                    self.remote_error(format!("Failed to get metadata: {}", service_error))
                }
            })?;

        Ok(response.content_length().unwrap_or(0).max(0) as u64)
    }

    async fn upload(&self, local_file: &Path, key: &str) -> Result<bool, StorageError> {
        let size = fs::metadata(local_file)
            .await
            .map_err(|e| self.io_error(format!("Failed to stat {}: {}", local_file.display(), e)))?
            .len();

        if size >= self.config.multipart_threshold_bytes {
            self.put_multipart(local_file, key, size).await?;
        } else {
            self.put_single(local_file, key).await?;
        }

        debug!(backend = %self.name, key = key, size, "object uploaded");
        Ok(true)
    }

    async fn download(&self, key: &str, local_file: &Path) -> Result<bool, StorageError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    return Ok(false);
                }
                return Err(self.remote_error(format!("Failed to get object: {}", service_error)));
            }
        };

        let write_error =
            |e: std::io::Error| self.io_error(format!("Failed to write {}: {}", local_file.display(), e));
        let mut file = fs::File::create(local_file).await.map_err(write_error)?;
        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| self.remote_error(format!("Failed to read object body: {}", e)))?
        {
            file.write_all(&chunk).await.map_err(write_error)?;
        }
        file.flush().await.map_err(write_error)?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        // S3 deletes are idempotent, so existence decides the answer
        if !self.exists(key).await? {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| self.remote_error(format!("Failed to delete object: {}", e)))?;
        Ok(true)
    }
}
