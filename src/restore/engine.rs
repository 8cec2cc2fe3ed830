// Restore engine: pre-flight, failover download, decrypt + verify, apply

use crate::codec::sha256_file;
use crate::context::DrContext;
use crate::ledger::{
    Alert, AlertType, Backup, BackupQuery, BackupType, Order, RestoreLog, RestoreLogGuard,
    RestoreMode, Severity,
};
use crate::monitoring::metrics;
use crate::scratch::ScratchDir;
use crate::storage::{download_with_failover, DownloadOutcome, StorageLocation};
use crate::tools::{ApplyMode, DumpScope, RestorePlan};
use crate::{DrError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreRequest {
    pub backup_id: Uuid,
    pub mode: RestoreMode,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub target_timestamp: Option<DateTime<Utc>>,
    pub initiated_by: Option<Uuid>,
    pub reason: String,
    /// Database to restore into; the platform database when unset
    pub target_connection: Option<String>,
}

impl RestoreRequest {
    fn new(backup_id: Uuid, mode: RestoreMode) -> Self {
        Self {
            backup_id,
            mode,
            tenant_ids: None,
            target_timestamp: None,
            initiated_by: None,
            reason: String::new(),
            target_connection: None,
        }
    }

    pub fn full(backup_id: Uuid) -> Self {
        Self::new(backup_id, RestoreMode::Full)
    }

    pub fn merge(backup_id: Uuid) -> Self {
        Self::new(backup_id, RestoreMode::Merge)
    }

    pub fn point_in_time(backup_id: Uuid, target: DateTime<Utc>) -> Self {
        let mut request = Self::new(backup_id, RestoreMode::Pitr);
        request.target_timestamp = Some(target);
        request
    }

    pub fn for_tenants(mut self, tenant_ids: Vec<Uuid>) -> Self {
        self.tenant_ids = Some(tenant_ids);
        self
    }

    pub fn initiated_by(mut self, operator: Uuid) -> Self {
        self.initiated_by = Some(operator);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn against(mut self, connection: impl Into<String>) -> Self {
        self.target_connection = Some(connection.into());
        self
    }

    /// The IN_PROGRESS log describing this request
    pub fn open_log(&self) -> RestoreLog {
        RestoreLog::new(
            self.backup_id,
            self.mode,
            self.initiated_by,
            self.reason.clone(),
        )
        .with_tenants(self.tenant_ids.clone())
        .with_target_timestamp(self.target_timestamp)
    }
}

/// An IN_PROGRESS log together with the guard that closes it as
/// CANCELLED if the restore is dropped before it runs to an end
pub struct PendingRestore {
    pub log: RestoreLog,
    guard: RestoreLogGuard,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restore_log: RestoreLog,
    pub source: StorageLocation,
}

pub struct RestoreEngine {
    ctx: DrContext,
}

impl RestoreEngine {
    pub fn new(ctx: DrContext) -> Self {
        Self { ctx }
    }

    /// Record an IN_PROGRESS log for `request`. Fails without writing
    /// anything when the backup does not exist.
    pub async fn begin(&self, request: &RestoreRequest) -> Result<PendingRestore> {
        self.load_backup(request.backup_id).await?;
        let log = request.open_log();
        self.ctx.ledger.insert_restore_log(&log).await?;
        let guard = RestoreLogGuard::new(Arc::clone(&self.ctx.ledger), log.id);
        info!(
            restore_log_id = %log.id,
            backup_id = %log.backup_id,
            mode = %log.mode,
            "Restore requested"
        );
        Ok(PendingRestore { log, guard })
    }

    /// `begin` followed by `execute`
    pub async fn restore(&self, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let pending = self.begin(request).await?;
        self.execute(pending, request).await
    }

    /// Drive an IN_PROGRESS log to COMPLETED or FAILED
    pub async fn execute(&self, pending: PendingRestore, request: &RestoreRequest) -> Result<RestoreOutcome> {
        let PendingRestore { mut log, mut guard } = pending;
        let started = Instant::now();

        let outcome = self.perform(request).await;
        let duration = started.elapsed().as_secs_f64();

        let recorded = match outcome {
            Ok((rows, source)) => self
                .record_success(&log, rows, duration)
                .await
                .map(|closed| (closed, source)),
            Err(e) => Err(e),
        };

        match recorded {
            Ok((closed, source)) => {
                guard.disarm();
                metrics::record_restore(closed.mode.as_str(), closed.status.as_str());
                info!(
                    restore_log_id = %closed.id,
                    backup_id = %closed.backup_id,
                    source = %source,
                    rows_restored = closed.rows_restored,
                    duration_seconds = duration,
                    "Restore completed"
                );
                Ok(RestoreOutcome {
                    restore_log: closed,
                    source,
                })
            }
            Err(e) => {
                self.fail(&mut log, &e, duration).await;
                guard.disarm();
                Err(e)
            }
        }
    }

    /// Persist the COMPLETED log. On error the stored row is still
    /// IN_PROGRESS and `log` is untouched.
    async fn record_success(&self, log: &RestoreLog, rows: u64, duration: f64) -> Result<RestoreLog> {
        let mut closed = log.clone();
        closed.complete(rows, duration)?;
        self.ctx.ledger.update_restore_log(&closed).await?;
        Ok(closed)
    }

    async fn perform(&self, request: &RestoreRequest) -> Result<(u64, StorageLocation)> {
        let backup = self.load_backup(request.backup_id).await?;
        self.preflight(&backup, request).await?;

        let scratch = ScratchDir::create(
            &self.ctx.config.storage.temp_dir,
            &format!("restore-{}", backup.id.simple()),
        )
        .await?;

        let download = self.download(&backup, scratch.path()).await?;
        let plaintext = self.open(&backup, &download.path, scratch.path()).await?;
        let rows = self.apply(&backup, &plaintext, request, scratch.path()).await?;
        Ok((rows, download.source))
    }

    pub async fn load_backup(&self, backup_id: Uuid) -> Result<Backup> {
        self.ctx
            .ledger
            .get_backup(backup_id)
            .await?
            .ok_or(DrError::BackupNotFound(backup_id))
    }

    /// Reject requests that cannot succeed, before anything is touched
    pub async fn preflight(&self, backup: &Backup, request: &RestoreRequest) -> Result<()> {
        if !backup.status.is_usable() {
            return Err(DrError::InvalidRequest(format!(
                "backup {} is {}, only COMPLETED or VERIFIED backups can be restored",
                backup.id, backup.status
            )));
        }
        if backup.backup_type == BackupType::WalArchive {
            return Err(DrError::InvalidRequest(format!(
                "backup {} is a WAL archive; WAL is replayed by point-in-time restores",
                backup.id
            )));
        }

        if let Some(tenant_ids) = &request.tenant_ids {
            if backup.backup_type != BackupType::TenantBackup {
                return Err(DrError::InvalidRequest(format!(
                    "tenant ids require a TENANT_BACKUP, backup {} is {}",
                    backup.id, backup.backup_type
                )));
            }
            if tenant_ids.is_empty() {
                return Err(DrError::InvalidRequest("tenant id list is empty".to_string()));
            }
            // A tenant dump holds only its owner's schema
            if let Some(stranger) = tenant_ids.iter().find(|t| Some(**t) != backup.tenant_id) {
                return Err(DrError::InvalidRequest(format!(
                    "backup {} only holds tenant {}, not tenant {}",
                    backup.id,
                    backup
                        .tenant_id
                        .map_or_else(|| "none".to_string(), |owner| owner.to_string()),
                    stranger
                )));
            }
        }

        match (request.mode, request.target_timestamp) {
            (RestoreMode::Pitr, None) => Err(DrError::InvalidRequest(
                "point-in-time restore requires a target timestamp".to_string(),
            )),
            (RestoreMode::Pitr, Some(target)) => self.check_wal_coverage(backup, target).await,
            (_, Some(_)) => Err(DrError::InvalidRequest(format!(
                "target timestamp is only valid for PITR, not {}",
                request.mode
            ))),
            (_, None) => Ok(()),
        }
    }

    async fn check_wal_coverage(&self, backup: &Backup, target: DateTime<Utc>) -> Result<()> {
        if backup.backup_type != BackupType::FullDatabase {
            return Err(DrError::InvalidRequest(format!(
                "point-in-time restore needs a FULL_DATABASE base backup, {} is {}",
                backup.id, backup.backup_type
            )));
        }
        if target < backup.created_at {
            return Err(DrError::InvalidRequest(format!(
                "target {} is before base backup {} ({})",
                target, backup.id, backup.created_at
            )));
        }
        if target > Utc::now() {
            return Err(DrError::InvalidRequest(format!("target {} is in the future", target)));
        }
        if self.ctx.wal_archiver.is_none() {
            return Err(DrError::InvalidRequest(
                "WAL archiving is not configured".to_string(),
            ));
        }

        let chain = self.wal_chain(backup, target).await?;
        if chain.last().map_or(true, |last| last.created_at < target) {
            return Err(DrError::InvalidRequest(format!(
                "archived WAL does not reach {}",
                target
            )));
        }
        Ok(())
    }

    /// Usable WAL archives after `base`, oldest first, up to and including
    /// the first one that reaches `target`
    async fn wal_chain(&self, base: &Backup, target: DateTime<Utc>) -> Result<Vec<Backup>> {
        let archives = self
            .ctx
            .ledger
            .list_backups(
                &BackupQuery::of_type(BackupType::WalArchive)
                    .usable()
                    .created_after(base.created_at)
                    .order(Order::OldestFirst),
            )
            .await?;

        let mut chain = Vec::new();
        for archive in archives {
            if archive.created_at <= base.created_at {
                continue;
            }
            let reaches = archive.created_at >= target;
            chain.push(archive);
            if reaches {
                break;
            }
        }
        Ok(chain)
    }

    pub async fn download(&self, backup: &Backup, scratch: &Path) -> Result<DownloadOutcome> {
        let destination = scratch.join(&backup.filename);
        download_with_failover(&self.ctx.storage, backup, &destination).await
    }

    /// Decrypt and decompress, then verify the plaintext checksum
    pub async fn open(&self, backup: &Backup, artifact: &Path, scratch: &Path) -> Result<PathBuf> {
        let plaintext = self
            .ctx
            .codec
            .decrypt_and_decompress(artifact, scratch)
            .await?;
        let actual = sha256_file(&plaintext).await?;
        if actual != backup.checksum {
            return Err(DrError::IntegrityMismatch(format!(
                "backup {} checksum is {}, decrypted dump hashes to {}",
                backup.id, backup.checksum, actual
            )));
        }
        debug!(backup_id = %backup.id, "Checksum verified");
        Ok(plaintext)
    }

    /// Apply a verified plaintext dump. Returns the rows restored.
    pub async fn apply(
        &self,
        backup: &Backup,
        plaintext: &Path,
        request: &RestoreRequest,
        scratch: &Path,
    ) -> Result<u64> {
        let connection = request
            .target_connection
            .clone()
            .unwrap_or_else(|| self.ctx.config.database.url.clone());
        let scope = DumpScope::for_backup(backup.backup_type, backup.tenant_id).ok_or_else(|| {
            DrError::InvalidRequest(format!(
                "backup {} ({}) is not a restorable dump",
                backup.id, backup.backup_type
            ))
        })?;
        let plan = RestorePlan {
            apply: match request.mode {
                RestoreMode::Merge => ApplyMode::Merge,
                RestoreMode::Full | RestoreMode::Pitr => ApplyMode::Replace,
            },
            scope,
            tenant_ids: request.tenant_ids.clone(),
        };

        let rows = self
            .ctx
            .dump_tool
            .apply_restore(plaintext, &connection, &plan)
            .await
            .map_err(|e| DrError::RestoreFailure(format!("{:#}", e)))?;
        debug!(backup_id = %backup.id, rows, apply = ?plan.apply, "Dump applied");

        if let (RestoreMode::Pitr, Some(target)) = (request.mode, request.target_timestamp) {
            self.replay_wal(backup, target, &connection, scratch).await?;
        }
        Ok(rows)
    }

    async fn replay_wal(
        &self,
        base: &Backup,
        target: DateTime<Utc>,
        connection: &str,
        scratch: &Path,
    ) -> Result<()> {
        let archiver = self
            .ctx
            .wal_archiver
            .as_ref()
            .ok_or_else(|| DrError::RestoreFailure("WAL archiving is not configured".to_string()))?;

        for archive in self.wal_chain(base, target).await? {
            let download = self.download(&archive, scratch).await?;
            let bundle = self.open(&archive, &download.path, scratch).await?;
            let segments = archiver
                .replay(&bundle, connection, target)
                .await
                .map_err(|e| DrError::RestoreFailure(format!("{:#}", e)))?;
            info!(
                wal_backup_id = %archive.id,
                source = %download.source,
                segments,
                "WAL archive replayed"
            );
        }
        Ok(())
    }

    async fn fail(&self, log: &mut RestoreLog, err: &DrError, duration: f64) {
        error!(
            restore_log_id = %log.id,
            backup_id = %log.backup_id,
            mode = %log.mode,
            error = %err,
            "Restore failed"
        );

        if let Err(e) = log.fail(err.to_string(), duration) {
            error!(restore_log_id = %log.id, error = %e, "Restore log already closed");
        } else if let Err(e) = self.ctx.ledger.update_restore_log(log).await {
            error!(restore_log_id = %log.id, error = %e, "Failed to record restore failure");
        }
        metrics::record_restore(log.mode.as_str(), log.status.as_str());

        let mut alert = Alert::new(
            AlertType::RestoreFailure,
            Severity::Critical,
            format!("{} restore of backup {} failed: {}", log.mode, log.backup_id, err),
        )
        .for_restore_log(log.id)
        .for_backup(log.backup_id)
        .detail("error", err.to_string())
        .detail("error_kind", err.kind());
        if let DrError::DownloadFailure { attempts } = err {
            alert = alert.detail("attempts", attempts.clone());
        }
        self.ctx.alerts.notify(alert).await;
    }
}
