//! Disaster recovery runbook
//!
//! Seven timed steps: select_backup, download, decrypt, restore,
//! restart_services, health_check and reroute_traffic. The total wall
//! clock of a successful run is the achieved recovery time (RTO) and is
//! exported as a metric.
//!
//! A single RestoreLog (mode FULL) is created once a backup has been
//! selected. Any fatal step fails the log, raises a CRITICAL
//! `RESTORE_FAILURE` alert and returns the step's error unchanged. A health
//! check that never reports healthy within its budget is not fatal: the
//! step is marked `manual_required` and the runbook carries on.

use crate::context::DrContext;
use crate::ledger::{
    Alert, AlertType, Backup, BackupQuery, BackupType, Order, RestoreLog, RestoreLogGuard,
    RestoreMode, Severity,
};
use crate::monitoring::metrics;
use crate::restore::{RestoreEngine, RestoreRequest};
use crate::scratch::ScratchDir;
use crate::storage::StorageLocation;
use crate::{DrError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepName {
    SelectBackup,
    Download,
    Decrypt,
    Restore,
    RestartServices,
    HealthCheck,
    RerouteTraffic,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SelectBackup => "select_backup",
            Self::Download => "download",
            Self::Decrypt => "decrypt",
            Self::Restore => "restore",
            Self::RestartServices => "restart_services",
            Self::HealthCheck => "health_check",
            Self::RerouteTraffic => "reroute_traffic",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    ManualRequired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: StepName,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<StorageLocation>,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrRequest {
    /// Restore this backup; the latest usable full backup when unset
    pub backup_id: Option<Uuid>,
    pub initiated_by: Option<Uuid>,
    pub reason: String,
}

impl DrRequest {
    pub fn latest() -> Self {
        Self::default()
    }

    pub fn from_backup(backup_id: Uuid) -> Self {
        Self {
            backup_id: Some(backup_id),
            ..Self::default()
        }
    }

    pub fn initiated_by(mut self, operator: Uuid) -> Self {
        self.initiated_by = Some(operator);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrReport {
    pub success: bool,
    pub restore_log_id: Uuid,
    pub backup_id: Uuid,
    pub duration_seconds: f64,
    pub steps: Vec<StepReport>,
}

impl DrReport {
    pub fn step(&self, name: StepName) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Step log shared by the runbook stages
#[derive(Default)]
struct Steps {
    reports: Vec<StepReport>,
}

impl Steps {
    /// Time `work`; a failure is recorded against `name` and returned
    async fn run<T, F>(&mut self, name: StepName, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        info!(step = %name, "Starting recovery step");
        let started = Instant::now();
        let result = work.await;
        let duration_seconds = started.elapsed().as_secs_f64();
        let (status, detail) = match &result {
            Ok(_) => (StepStatus::Completed, None),
            Err(e) => (StepStatus::Failed, Some(e.to_string())),
        };
        self.reports.push(StepReport {
            name,
            status,
            source: None,
            duration_seconds,
            detail,
        });
        result
    }

    fn last_mut(&mut self) -> Option<&mut StepReport> {
        self.reports.last_mut()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.reports).unwrap_or_default()
    }
}

pub struct DisasterRecovery {
    ctx: DrContext,
    engine: RestoreEngine,
}

impl DisasterRecovery {
    pub fn new(ctx: DrContext) -> Self {
        let engine = RestoreEngine::new(ctx.clone());
        Self { ctx, engine }
    }

    pub async fn run(&self, request: DrRequest) -> Result<DrReport> {
        let started = Instant::now();
        let mut steps = Steps::default();
        warn!(backup_id = ?request.backup_id, reason = %request.reason, "Disaster recovery started");

        let backup = match steps.run(StepName::SelectBackup, self.select(&request)).await {
            Ok(backup) => backup,
            Err(e) => {
                self.alert_failure(None, None, &e, &steps).await;
                return Err(e);
            }
        };

        let mut log = RestoreLog::new(backup.id, RestoreMode::Full, request.initiated_by, request.reason.clone());
        self.ctx.ledger.insert_restore_log(&log).await?;
        let mut guard = RestoreLogGuard::new(Arc::clone(&self.ctx.ledger), log.id);

        let outcome = self.recover(&backup, &mut steps).await;
        let duration = started.elapsed().as_secs_f64();

        let recorded = match outcome {
            Ok(rows) => {
                let mut closed = log.clone();
                match closed.complete(rows, duration) {
                    Ok(()) => self
                        .ctx
                        .ledger
                        .update_restore_log(&closed)
                        .await
                        .map(|()| closed),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        };

        match recorded {
            Ok(log) => {
                guard.disarm();
                metrics::record_restore(log.mode.as_str(), log.status.as_str());
                metrics::record_rto(duration);
                info!(
                    restore_log_id = %log.id,
                    backup_id = %backup.id,
                    rto_seconds = duration,
                    "Disaster recovery completed"
                );
                Ok(DrReport {
                    success: true,
                    restore_log_id: log.id,
                    backup_id: backup.id,
                    duration_seconds: duration,
                    steps: steps.reports,
                })
            }
            Err(e) => {
                error!(restore_log_id = %log.id, backup_id = %backup.id, error = %e, "Disaster recovery failed");
                if log.fail(e.to_string(), duration).is_ok() {
                    if let Err(update) = self.ctx.ledger.update_restore_log(&log).await {
                        error!(restore_log_id = %log.id, error = %update, "Failed to record recovery failure");
                    }
                }
                guard.disarm();
                metrics::record_restore(log.mode.as_str(), log.status.as_str());
                self.alert_failure(Some(&log), Some(backup.id), &e, &steps).await;
                Err(e)
            }
        }
    }

    async fn select(&self, request: &DrRequest) -> Result<Backup> {
        let backup = match request.backup_id {
            Some(backup_id) => self.engine.load_backup(backup_id).await?,
            None => self
                .ctx
                .ledger
                .list_backups(
                    &BackupQuery::of_type(BackupType::FullDatabase)
                        .usable()
                        .order(Order::NewestFirst)
                        .limit(1),
                )
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    DrError::NoBackupAvailable(
                        "no COMPLETED or VERIFIED full database backup exists".to_string(),
                    )
                })?,
        };
        self.engine
            .preflight(&backup, &RestoreRequest::full(backup.id))
            .await?;
        info!(backup_id = %backup.id, filename = %backup.filename, "Recovery backup selected");
        Ok(backup)
    }

    /// Steps 2-7; returns the rows restored
    async fn recover(&self, backup: &Backup, steps: &mut Steps) -> Result<u64> {
        let scratch = ScratchDir::create(
            &self.ctx.config.storage.temp_dir,
            &format!("dr-{}", backup.id.simple()),
        )
        .await?;

        let download = steps
            .run(StepName::Download, self.engine.download(backup, scratch.path()))
            .await?;
        if let Some(step) = steps.last_mut() {
            step.source = Some(download.source);
        }

        let plaintext = steps
            .run(
                StepName::Decrypt,
                self.engine.open(backup, &download.path, scratch.path()),
            )
            .await?;

        let request = RestoreRequest::full(backup.id);
        let rows = steps
            .run(
                StepName::Restore,
                self.engine.apply(backup, &plaintext, &request, scratch.path()),
            )
            .await?;
        if let Some(step) = steps.last_mut() {
            step.detail = Some(format!("{} rows restored", rows));
        }

        steps
            .run(StepName::RestartServices, async {
                self.ctx
                    .infrastructure
                    .restart_services()
                    .await
                    .map_err(|e| DrError::Infrastructure(format!("restart failed: {:#}", e)))
            })
            .await?;

        let healthy = steps.run(StepName::HealthCheck, self.wait_healthy()).await?;
        if !healthy {
            let budget = self.ctx.config.dr.health_check_budget_secs;
            if let Some(step) = steps.last_mut() {
                step.status = StepStatus::ManualRequired;
                step.detail = Some(format!("services not healthy after {}s", budget));
            }
            self.ctx
                .alerts
                .notify(
                    Alert::new(
                        AlertType::RestoreFailure,
                        Severity::Warning,
                        format!(
                            "Services did not report healthy within {}s after recovery; manual check required",
                            budget
                        ),
                    )
                    .for_backup(backup.id),
                )
                .await;
        }

        steps
            .run(StepName::RerouteTraffic, async {
                self.ctx
                    .infrastructure
                    .reroute_traffic()
                    .await
                    .map_err(|e| DrError::Infrastructure(format!("reroute failed: {:#}", e)))
            })
            .await?;

        Ok(rows)
    }

    /// Poll the health check until it passes or the budget runs out
    async fn wait_healthy(&self) -> Result<bool> {
        let settings = &self.ctx.config.dr;
        let deadline = Instant::now() + Duration::from_secs(settings.health_check_budget_secs);
        let interval = Duration::from_secs(settings.health_poll_interval_secs.max(1));

        loop {
            match self.ctx.infrastructure.health_check().await {
                Ok(true) => return Ok(true),
                Ok(false) => info!("Services not healthy yet"),
                Err(e) => warn!(error = %format!("{:#}", e), "Health check failed"),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    async fn alert_failure(
        &self,
        log: Option<&RestoreLog>,
        backup_id: Option<Uuid>,
        err: &DrError,
        steps: &Steps,
    ) {
        let mut alert = Alert::new(
            AlertType::RestoreFailure,
            Severity::Critical,
            format!("Disaster recovery failed: {}", err),
        )
        .detail("error", err.to_string())
        .detail("error_kind", err.kind())
        .detail("steps", steps.to_json());
        if let Some(log) = log {
            alert = alert.for_restore_log(log.id);
        }
        if let Some(backup_id) = backup_id {
            alert = alert.for_backup(backup_id);
        }
        self.ctx.alerts.notify(alert).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_step_is_recorded_with_detail() {
        let mut steps = Steps::default();
        let ok: Result<u8> = steps.run(StepName::SelectBackup, async { Ok(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let failed: Result<()> = steps
            .run(StepName::Download, async {
                Err(DrError::DownloadFailure { attempts: Vec::new() })
            })
            .await;
        assert!(failed.is_err());

        assert_eq!(steps.reports.len(), 2);
        assert_eq!(steps.reports[0].status, StepStatus::Completed);
        assert_eq!(steps.reports[1].status, StepStatus::Failed);
        assert_eq!(
            steps.reports[1].detail.as_deref(),
            Some("Failed to download backup from any storage location")
        );
    }

    #[test]
    fn test_step_names_serialize_as_snake_case() {
        assert_eq!(
            serde_json::to_value(StepName::RestartServices).unwrap(),
            serde_json::json!("restart_services")
        );
        assert_eq!(StepName::HealthCheck.to_string(), "health_check");
    }
}
