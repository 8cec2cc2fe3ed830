// Backup pipeline: dump, seal, upload to every expected location, cross-check

use super::naming::{backup_filename, dump_filename};
use super::BackupLocks;
use crate::context::DrContext;
use crate::ledger::{
    Alert, AlertType, Backup, BackupGuard, BackupQuery, BackupStatus, BackupType, Order, Severity,
};
use crate::monitoring::{checks, metrics};
use crate::scratch::ScratchDir;
use crate::storage::{object_key, StorageLocation};
use crate::tools::DumpScope;
use crate::verify::cross_check;
use crate::{DrError, Result};
use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct BackupRequest {
    pub backup_type: BackupType,
    pub tenant_id: Option<Uuid>,
    pub notes: Option<String>,
    pub initiated_by: Option<Uuid>,
}

impl BackupRequest {
    pub fn new(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            tenant_id: None,
            notes: None,
            initiated_by: None,
        }
    }

    pub fn tenant(tenant_id: Uuid) -> Self {
        Self::new(BackupType::TenantBackup).for_tenant(tenant_id)
    }

    pub fn for_tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn initiated_by(mut self, operator: Uuid) -> Self {
        self.initiated_by = Some(operator);
        self
    }
}

pub struct BackupEngine {
    ctx: DrContext,
    locks: BackupLocks,
}

impl BackupEngine {
    pub fn new(ctx: DrContext, locks: BackupLocks) -> Self {
        Self { ctx, locks }
    }

    /// Reject requests that can never run, before anything is written
    pub fn validate(&self, request: &BackupRequest) -> Result<()> {
        match (request.backup_type, request.tenant_id) {
            (BackupType::TenantBackup, None) => Err(DrError::InvalidRequest(
                "TENANT_BACKUP requires a tenant id".to_string(),
            )),
            (BackupType::TenantBackup, Some(_)) => Ok(()),
            (other, Some(_)) => Err(DrError::InvalidRequest(format!(
                "{} backups are not tenant scoped",
                other
            ))),
            (BackupType::WalArchive, None) if self.ctx.wal_archiver.is_none() => Err(
                DrError::InvalidRequest("WAL archiving is not configured".to_string()),
            ),
            _ => Ok(()),
        }
    }

    /// Run one backup to a terminal state.
    ///
    /// On success the returned backup is VERIFIED, or COMPLETED when the
    /// post-upload cross-check found a problem (a WARNING alert is raised).
    /// Any other failure leaves the row FAILED with the error in `notes`,
    /// raises one CRITICAL `BACKUP_FAILURE` alert and returns the error.
    pub async fn run(&self, request: BackupRequest) -> Result<Backup> {
        self.validate(&request)?;

        let started = Instant::now();
        let mut backup = Backup::new(request.backup_type, request.tenant_id, String::new());
        backup.filename = backup_filename(
            backup.backup_type,
            backup.tenant_id,
            backup.id,
            backup.created_at,
        );
        backup.notes = request.notes.unwrap_or_default();
        backup.initiated_by = request.initiated_by;

        let _lock = self
            .locks
            .acquire(backup.backup_type, backup.tenant_id, backup.id)?;

        self.ctx.ledger.insert_backup(&backup).await?;
        let mut guard = BackupGuard::new(Arc::clone(&self.ctx.ledger), backup.id);

        info!(
            backup_id = %backup.id,
            backup_type = %backup.backup_type,
            tenant_id = ?backup.tenant_id,
            filename = %backup.filename,
            "Starting backup"
        );

        let outcome = self.execute(&mut backup, started).await;
        let duration = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                guard.disarm();
                metrics::record_backup(
                    backup.backup_type.as_str(),
                    backup.status.as_str(),
                    duration,
                    backup.size_bytes,
                );
                info!(
                    backup_id = %backup.id,
                    status = %backup.status,
                    size_bytes = backup.size_bytes,
                    duration_seconds = duration,
                    "Backup finished"
                );

                if let Err(e) = checks::run_post_backup_checks(
                    self.ctx.ledger.as_ref(),
                    &self.ctx.alerts,
                    &self.ctx.config.monitoring,
                    &backup,
                )
                .await
                {
                    warn!(backup_id = %backup.id, error = %e, "Post-backup checks failed");
                }
                Ok(backup)
            }
            Err(e) => {
                self.fail(&mut backup, &e, duration).await;
                guard.disarm();
                Err(e)
            }
        }
    }

    async fn execute(&self, backup: &mut Backup, started: Instant) -> Result<()> {
        let scratch = ScratchDir::create(
            &self.ctx.config.storage.temp_dir,
            &format!("backup-{}", backup.id.simple()),
        )
        .await?;
        let dump_path = scratch.file(&dump_filename(&backup.filename));

        self.dump(backup, &dump_path).await?;

        let sealed = self
            .ctx
            .codec
            .compress_and_encrypt(&dump_path, scratch.path())
            .await?;
        backup.checksum = sealed.plaintext_sha256.clone();
        backup.size_bytes = sealed.compressed_size;
        backup.compression_ratio = Some(sealed.compression_ratio());
        backup
            .metadata
            .insert("artifact_sha256".to_string(), json!(sealed.artifact_sha256));
        backup
            .metadata
            .insert("original_size_bytes".to_string(), json!(sealed.original_size));
        debug!(
            backup_id = %backup.id,
            original_size = sealed.original_size,
            compressed_size = sealed.compressed_size,
            "Dump sealed"
        );

        self.upload(backup, &sealed.path).await?;

        backup.status = BackupStatus::Completed;
        self.ctx.ledger.update_backup(backup).await?;

        let check = cross_check(
            &self.ctx.storage,
            backup,
            &sealed.artifact_sha256,
            scratch.path(),
        )
        .await;
        if check.passed() {
            backup.status = BackupStatus::Verified;
            backup.verified_at = Some(Utc::now());
        } else {
            let errors = check.errors();
            warn!(backup_id = %backup.id, errors = ?errors, "Post-upload cross-check failed");
            let alert = Alert::new(
                AlertType::IntegrityFailure,
                Severity::Warning,
                format!("Cross-check failed after uploading backup {}", backup.filename),
            )
            .for_backup(backup.id)
            .detail("errors", errors);
            self.ctx.alerts.notify(alert).await;
        }

        backup.duration_seconds = Some(started.elapsed().as_secs_f64());
        backup.check_invariants().map_err(DrError::IntegrityMismatch)?;
        self.ctx.ledger.update_backup(backup).await?;
        Ok(())
    }

    async fn dump(&self, backup: &mut Backup, output: &Path) -> Result<()> {
        let connection = &self.ctx.config.database.url;
        if backup.backup_type == BackupType::WalArchive {
            return self.capture_wal(backup, output).await;
        }
        let scope = DumpScope::for_backup(backup.backup_type, backup.tenant_id).ok_or_else(|| {
            DrError::InvalidRequest("TENANT_BACKUP requires a tenant id".to_string())
        })?;

        self.ctx
            .dump_tool
            .dump(output, connection, scope)
            .await
            .map_err(|e| DrError::DumpFailure(format!("{:#}", e)))?;
        debug!(backup_id = %backup.id, scope = ?scope, "Dump written");
        Ok(())
    }

    /// Capture segments archived since the last usable WAL backup
    async fn capture_wal(&self, backup: &mut Backup, output: &Path) -> Result<()> {
        let archiver = self
            .ctx
            .wal_archiver
            .as_ref()
            .ok_or_else(|| DrError::InvalidRequest("WAL archiving is not configured".to_string()))?;

        let previous = self
            .ctx
            .ledger
            .list_backups(
                &BackupQuery::of_type(BackupType::WalArchive)
                    .usable()
                    .order(Order::NewestFirst)
                    .limit(1),
            )
            .await?;
        let since = previous.first().map(|b| b.created_at);

        let capture = archiver
            .capture(output, since)
            .await
            .map_err(|e| DrError::DumpFailure(format!("{:#}", e)))?;
        backup
            .metadata
            .insert("wal_segments".to_string(), json!(capture.segments));
        if let Some(last) = capture.last_segment {
            backup
                .metadata
                .insert("last_wal_segment".to_string(), json!(last));
        }
        debug!(backup_id = %backup.id, segments = capture.segments, since = ?since, "WAL captured");
        Ok(())
    }

    /// Upload to every expected location in parallel. Successful locators
    /// are recorded even when another location fails.
    async fn upload(&self, backup: &mut Backup, artifact: &Path) -> Result<()> {
        let key = object_key(backup.backup_type, &backup.filename);
        let locations = StorageLocation::expected_for(backup.backup_type);

        let uploads = locations.iter().map(|location| {
            let key = key.as_str();
            async move {
                (
                    *location,
                    self.ctx.storage.upload(*location, artifact, key).await,
                )
            }
        });
        let results = join_all(uploads).await;

        let mut failures = Vec::new();
        for (location, result) in results {
            match result {
                Ok(true) => {
                    backup.set_locator(location, key.clone());
                    debug!(backup_id = %backup.id, location = %location, key = %key, "Artifact uploaded");
                }
                Ok(false) => failures.push(format!("{}: upload rejected", location)),
                Err(e) => failures.push(format!("{}: {}", location, e)),
            }
        }

        self.ctx.ledger.update_backup(backup).await?;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DrError::UploadFailure(failures.join("; ")))
        }
    }

    async fn fail(&self, backup: &mut Backup, err: &DrError, duration: f64) {
        error!(
            backup_id = %backup.id,
            backup_type = %backup.backup_type,
            error = %err,
            "Backup failed"
        );

        backup.status = BackupStatus::Failed;
        backup.duration_seconds = Some(duration);
        backup.notes = if backup.notes.is_empty() {
            err.to_string()
        } else {
            format!("{}\n{}", backup.notes, err)
        };
        if let Err(e) = self.ctx.ledger.update_backup(backup).await {
            error!(backup_id = %backup.id, error = %e, "Failed to record backup failure");
        }
        metrics::record_backup(backup.backup_type.as_str(), backup.status.as_str(), duration, 0);

        let alert = Alert::new(
            AlertType::BackupFailure,
            Severity::Critical,
            format!("{} backup {} failed: {}", backup.backup_type, backup.filename, err),
        )
        .for_backup(backup.id)
        .detail("error", err.to_string())
        .detail("error_kind", err.kind());
        self.ctx.alerts.notify(alert).await;
    }
}
