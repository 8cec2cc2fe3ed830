// Automated test restore into a throwaway database

use super::engine::{RestoreEngine, RestoreRequest};
use crate::context::DrContext;
use crate::ledger::{Alert, AlertType, BackupQuery, BackupType, Order, Severity};
use crate::tools::DatabaseAdmin;
use crate::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tracing::{error, info, warn};
use uuid::Uuid;

const DATABASE_PREFIX: &str = "dr_restore_test_";

/// One check of the restored database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl IntegrityCheck {
    fn new(name: &str, passed: bool, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        }
    }

    fn errored(name: &str, err: anyhow::Error) -> Self {
        Self::new(name, false, format!("check failed: {:#}", err))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRestoreReport {
    pub success: bool,
    pub backup_id: Option<Uuid>,
    pub restore_log_id: Option<Uuid>,
    pub test_database: Option<String>,
    pub duration_seconds: f64,
    pub integrity_checks: Vec<IntegrityCheck>,
    pub errors: Vec<String>,
}

/// Unique `dr_restore_test_<12 hex>` name
pub fn test_database_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}{}", DATABASE_PREFIX, &suffix[..12])
}

fn test_request(backup_id: Uuid) -> RestoreRequest {
    RestoreRequest::full(backup_id).with_reason("automated test restore")
}

/// `wanted` is `schema.table`, or a bare name in the `public` schema
fn table_listed(wanted: &str, tables: &[String]) -> bool {
    let qualified = if wanted.contains('.') {
        wanted.to_string()
    } else {
        format!("public.{}", wanted)
    };
    tables.iter().any(|table| *table == qualified)
}

/// Drops the ephemeral database if the run is abandoned before cleanup
struct EphemeralDatabase {
    admin: Arc<dyn DatabaseAdmin>,
    name: String,
    dropped: bool,
}

impl EphemeralDatabase {
    async fn drop_now(&mut self) -> anyhow::Result<()> {
        self.dropped = true;
        self.admin.drop_database(&self.name).await
    }
}

impl Drop for EphemeralDatabase {
    fn drop(&mut self) {
        if self.dropped {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(database = %self.name, "No runtime to drop abandoned test database");
            return;
        };
        let admin = Arc::clone(&self.admin);
        let name = self.name.clone();
        handle.spawn(async move {
            if let Err(e) = admin.drop_database(&name).await {
                warn!(database = %name, error = %format!("{:#}", e), "Failed to drop abandoned test database");
            }
        });
    }
}

pub struct TestRestoreRunner {
    ctx: DrContext,
}

impl TestRestoreRunner {
    pub fn new(ctx: DrContext) -> Self {
        Self { ctx }
    }

    /// Restore the latest recent full backup into a fresh database, check
    /// it and drop it. Problems end up in the report, not in the error:
    /// only ledger failures are returned as `Err`.
    pub async fn run(&self) -> Result<TestRestoreReport> {
        let started = Instant::now();
        let lookback_days = self.ctx.config.test_restore.lookback_days;
        let mut report = TestRestoreReport::default();

        let candidates = self
            .ctx
            .ledger
            .list_backups(
                &BackupQuery::of_type(BackupType::FullDatabase)
                    .usable()
                    .created_after(Utc::now() - Duration::days(lookback_days))
                    .order(Order::NewestFirst)
                    .limit(1),
            )
            .await?;

        let Some(backup) = candidates.into_iter().next() else {
            let message = format!(
                "No recent backups available for test restore (last {} days)",
                lookback_days
            );
            report.errors.push(message.clone());
            report.duration_seconds = started.elapsed().as_secs_f64();
            self.ctx
                .alerts
                .raise(
                    Alert::new(AlertType::RestoreTest, Severity::Warning, message)
                        .detail("lookback_days", lookback_days),
                )
                .await?;
            return Ok(report);
        };

        report.backup_id = Some(backup.id);
        let name = test_database_name();
        report.test_database = Some(name.clone());
        info!(backup_id = %backup.id, database = %name, "Starting test restore");

        match self.ctx.admin.create_database(&name).await {
            Err(e) => {
                let message = format!("failed to create test database {}: {:#}", name, e);
                error!(backup_id = %backup.id, database = %name, error = %message, "Test restore failed");
                let mut log = test_request(backup.id).open_log();
                if log.fail(message.clone(), started.elapsed().as_secs_f64()).is_ok() {
                    self.ctx.ledger.insert_restore_log(&log).await?;
                    report.restore_log_id = Some(log.id);
                }
                report.errors.push(message);
            }
            Ok(connection) => {
                let mut database = EphemeralDatabase {
                    admin: Arc::clone(&self.ctx.admin),
                    name: name.clone(),
                    dropped: false,
                };

                self.restore_and_check(backup.id, &connection, &mut report)
                    .await;

                if let Err(e) = database.drop_now().await {
                    warn!(database = %name, error = %format!("{:#}", e), "Failed to drop test database");
                    report
                        .errors
                        .push(format!("failed to drop test database {}: {:#}", name, e));
                }
            }
        }

        report.success = report.errors.is_empty()
            && !report.integrity_checks.is_empty()
            && report.integrity_checks.iter().all(|c| c.passed);
        report.duration_seconds = started.elapsed().as_secs_f64();
        self.summarize(&report).await?;
        Ok(report)
    }

    async fn restore_and_check(&self, backup_id: Uuid, connection: &str, report: &mut TestRestoreReport) {
        let request = test_request(backup_id).against(connection);

        match RestoreEngine::new(self.ctx.clone()).restore(&request).await {
            Ok(outcome) => {
                report.restore_log_id = Some(outcome.restore_log.id);
                report.integrity_checks = self.run_checks(connection).await;
            }
            Err(e) => {
                error!(backup_id = %backup_id, error = %e, "Test restore failed");
                report.errors.push(e.to_string());
            }
        }
    }

    async fn run_checks(&self, connection: &str) -> Vec<IntegrityCheck> {
        let admin = &self.ctx.admin;
        let mut checks = Vec::with_capacity(4);

        checks.push(match admin.list_tables(connection).await {
            Ok(tables) => {
                let missing: Vec<&String> = self
                    .ctx
                    .config
                    .test_restore
                    .core_tables
                    .iter()
                    .filter(|wanted| !table_listed(wanted, &tables))
                    .collect();
                if missing.is_empty() {
                    IntegrityCheck::new("table_existence", true, format!("{} tables present", tables.len()))
                } else {
                    IntegrityCheck::new("table_existence", false, format!("missing tables: {:?}", missing))
                }
            }
            Err(e) => IntegrityCheck::errored("table_existence", e),
        });

        checks.push(match admin.row_counts(connection).await {
            Ok(counts) => {
                let total: i64 = counts.iter().map(|(_, n)| n).sum();
                IntegrityCheck::new(
                    "row_counts",
                    total > 0,
                    format!("{} rows across {} tables", total, counts.len()),
                )
            }
            Err(e) => IntegrityCheck::errored("row_counts", e),
        });

        checks.push(match admin.orphaned_references(connection).await {
            Ok(orphans) if orphans.is_empty() => {
                IntegrityCheck::new("foreign_key_integrity", true, "no orphaned references")
            }
            Ok(orphans) => IntegrityCheck::new("foreign_key_integrity", false, orphans.join("; ")),
            Err(e) => IntegrityCheck::errored("foreign_key_integrity", e),
        });

        checks.push(match admin.structural_problems(connection).await {
            Ok(problems) if problems.is_empty() => {
                IntegrityCheck::new("data_corruption", true, "no structural problems")
            }
            Ok(problems) => IntegrityCheck::new("data_corruption", false, problems.join("; ")),
            Err(e) => IntegrityCheck::errored("data_corruption", e),
        });

        checks
    }

    async fn summarize(&self, report: &TestRestoreReport) -> Result<()> {
        let (severity, message) = if report.success {
            (Severity::Info, "Automated test restore passed".to_string())
        } else {
            (
                Severity::Error,
                format!("Automated test restore failed: {}", failure_summary(report)),
            )
        };

        let mut alert = Alert::new(AlertType::RestoreTest, severity, message)
            .detail("test_database", report.test_database.clone())
            .detail("duration_seconds", report.duration_seconds)
            .detail("integrity_checks", serde_json::to_value(&report.integrity_checks)?)
            .detail("errors", report.errors.clone());
        if let Some(backup_id) = report.backup_id {
            alert = alert.for_backup(backup_id);
        }
        if let Some(restore_log_id) = report.restore_log_id {
            alert = alert.for_restore_log(restore_log_id);
        }
        self.ctx.alerts.raise(alert).await?;
        Ok(())
    }
}

fn failure_summary(report: &TestRestoreReport) -> String {
    let failed: Vec<&str> = report
        .integrity_checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.name.as_str())
        .collect();
    match (report.errors.first(), failed.is_empty()) {
        (Some(first), _) => first.clone(),
        (None, false) => format!("checks failed: {}", failed.join(", ")),
        (None, true) => "no checks ran".to_string(),
    }
}
