//! Trigger surface for operators and the scheduler
//!
//! Every long-running operation is submitted to the job queue and returns a
//! [`JobHandle`]; reads go straight to the ledger.

use crate::backup::{BackupEngine, BackupLocks};
use crate::context::DrContext;
use crate::dr::{DisasterRecovery, DrRequest};
use crate::jobs::{JobHandle, JobKind, JobQueue, JobRecord};
use crate::ledger::{Alert, AlertQuery, Backup, BackupQuery, RestoreLog, WalArchivingConfig};
use crate::monitoring::gather_metrics;
use crate::restore::{RestoreEngine, RestoreRequest, TestRestoreRunner};
use crate::retention::RetentionRunner;
use crate::verify::IntegrityVerifier;
use crate::{DrError, Result};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

pub use crate::backup::BackupRequest;

/// A submitted restore: the job plus its IN_PROGRESS log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RestoreTicket {
    pub job: JobHandle,
    pub restore_log_id: Uuid,
}

#[derive(Clone)]
pub struct DrService {
    ctx: DrContext,
    jobs: JobQueue,
    locks: BackupLocks,
}

fn to_output<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

impl DrService {
    /// Start the job queue for `ctx`. Must be called inside a tokio runtime.
    pub fn new(ctx: DrContext) -> Self {
        let jobs = JobQueue::new(&ctx.config.jobs);
        Self {
            ctx,
            jobs,
            locks: BackupLocks::new(),
        }
    }

    pub fn context(&self) -> &DrContext {
        &self.ctx
    }

    pub fn backup_engine(&self) -> BackupEngine {
        BackupEngine::new(self.ctx.clone(), self.locks.clone())
    }

    pub fn trigger_backup(&self, request: BackupRequest) -> Result<JobHandle> {
        let engine = self.backup_engine();
        engine.validate(&request)?;
        info!(backup_type = %request.backup_type, tenant_id = ?request.tenant_id, "Backup triggered");
        self.jobs.submit(JobKind::Backup, async move {
            let backup = engine.run(request).await?;
            to_output(&backup)
        })
    }

    /// Reserve a job slot, record the restore log, then queue the restore
    /// itself. A full queue rejects the request before any log is written.
    pub async fn trigger_restore(&self, request: RestoreRequest) -> Result<RestoreTicket> {
        let slot = self.jobs.reserve(JobKind::Restore)?;
        let engine = RestoreEngine::new(self.ctx.clone());
        let pending = engine.begin(&request).await?;
        let restore_log_id = pending.log.id;

        let job = slot.submit(async move {
            let outcome = engine.execute(pending, &request).await?;
            to_output(&outcome)
        });
        Ok(RestoreTicket {
            job,
            restore_log_id,
        })
    }

    pub fn trigger_disaster_recovery(&self, request: DrRequest) -> Result<JobHandle> {
        let runbook = DisasterRecovery::new(self.ctx.clone());
        info!(backup_id = ?request.backup_id, "Disaster recovery triggered");
        self.jobs.submit(JobKind::DisasterRecovery, async move {
            let report = runbook.run(request).await?;
            to_output(&report)
        })
    }

    pub fn trigger_integrity_sweep(&self) -> Result<JobHandle> {
        let verifier = IntegrityVerifier::new(self.ctx.clone());
        self.jobs.submit(JobKind::IntegritySweep, async move {
            let report = verifier.run().await?;
            to_output(&report)
        })
    }

    pub fn trigger_retention(&self) -> Result<JobHandle> {
        let runner = RetentionRunner::new(self.ctx.clone());
        self.jobs.submit(JobKind::Retention, async move {
            let report = runner.run().await?;
            to_output(&report)
        })
    }

    pub fn trigger_test_restore(&self) -> Result<JobHandle> {
        let runner = TestRestoreRunner::new(self.ctx.clone());
        self.jobs.submit(JobKind::TestRestore, async move {
            let report = runner.run().await?;
            to_output(&report)
        })
    }

    pub fn job_status(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.status(job_id)
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.jobs()
    }

    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        self.jobs.cancel(job_id)
    }

    /// Wait for a job to reach a terminal state
    pub async fn wait_for_job(&self, job_id: Uuid) -> Option<JobRecord> {
        self.jobs.wait(job_id).await
    }

    pub async fn backup(&self, backup_id: Uuid) -> Result<Backup> {
        self.ctx
            .ledger
            .get_backup(backup_id)
            .await?
            .ok_or(DrError::BackupNotFound(backup_id))
    }

    pub async fn backups(&self, query: &BackupQuery) -> Result<Vec<Backup>> {
        self.ctx.ledger.list_backups(query).await
    }

    pub async fn restore_log(&self, restore_log_id: Uuid) -> Result<RestoreLog> {
        self.ctx
            .ledger
            .get_restore_log(restore_log_id)
            .await?
            .ok_or(DrError::RestoreLogNotFound(restore_log_id))
    }

    pub async fn restore_logs(&self, backup_id: Option<Uuid>) -> Result<Vec<RestoreLog>> {
        self.ctx.ledger.list_restore_logs(backup_id).await
    }

    pub async fn alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        self.ctx.ledger.list_alerts(query).await
    }

    pub async fn acknowledge_alert(&self, alert_id: Uuid, operator: Uuid) -> Result<Alert> {
        self.ctx.alerts.acknowledge(alert_id, operator).await
    }

    pub async fn resolve_alert(&self, alert_id: Uuid) -> Result<Alert> {
        self.ctx.alerts.resolve(alert_id).await
    }

    pub async fn wal_config(&self) -> Result<WalArchivingConfig> {
        self.ctx.ledger.wal_config().await
    }

    /// Validate and persist a new WAL archiving interval
    pub async fn set_wal_interval(&self, seconds: u64) -> Result<WalArchivingConfig> {
        let config = WalArchivingConfig::new(seconds)?;
        self.ctx.ledger.save_wal_config(config).await?;
        info!(archive_interval_seconds = seconds, "WAL archiving interval updated");
        Ok(config)
    }

    /// Prometheus text exposition of the process metrics
    pub fn metrics(&self) -> String {
        gather_metrics()
    }
}
