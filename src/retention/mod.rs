//! Retention and cleanup
//!
//! Ages out local copies after `retention.local_days` and object-store
//! copies after `retention.cloud_days`, clearing the matching locators.
//! Rows left without any locator are deleted (IN_PROGRESS rows are never
//! touched) and the temp directory is swept of stale working files. A
//! backend failure is counted and the copy is retried on the next run.

use crate::context::DrContext;
use crate::ledger::{Alert, AlertType, Backup, BackupQuery, BackupStatus, Severity};
use crate::monitoring::metrics;
use crate::storage::StorageLocation;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration as StdDuration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub local_deleted: u64,
    pub primary_deleted: u64,
    pub secondary_deleted: u64,
    pub rows_deleted: u64,
    pub temp_entries_deleted: u64,
    pub backend_failures: u64,
    pub errors: Vec<String>,
}

impl RetentionReport {
    pub fn total_deletions(&self) -> u64 {
        self.local_deleted
            + self.primary_deleted
            + self.secondary_deleted
            + self.rows_deleted
            + self.temp_entries_deleted
    }

    fn count_copy(&mut self, location: StorageLocation) {
        match location {
            StorageLocation::Local => self.local_deleted += 1,
            StorageLocation::Primary => self.primary_deleted += 1,
            StorageLocation::Secondary => self.secondary_deleted += 1,
        }
    }
}

pub struct RetentionRunner {
    ctx: DrContext,
}

impl RetentionRunner {
    pub fn new(ctx: DrContext) -> Self {
        Self { ctx }
    }

    pub async fn run(&self) -> Result<RetentionReport> {
        let now = Utc::now();
        let settings = &self.ctx.config.retention;
        let local_cutoff = now - Duration::days(settings.local_days);
        let cloud_cutoff = now - Duration::days(settings.cloud_days);

        let mut report = RetentionReport::default();
        let backups = self.ctx.ledger.list_backups(&BackupQuery::default()).await?;
        info!(rows = backups.len(), "Starting retention run");

        for mut backup in backups {
            if backup.status == BackupStatus::InProgress {
                continue;
            }
            let changed = self
                .expire_copies(&mut backup, local_cutoff, cloud_cutoff, &mut report)
                .await;

            if !backup.has_any_locator() {
                if self.ctx.ledger.delete_backup(backup.id).await? {
                    report.rows_deleted += 1;
                    debug!(backup_id = %backup.id, "Backup row without copies deleted");
                }
            } else if changed {
                self.ctx.ledger.update_backup(&backup).await?;
            }
        }

        let swept = self.sweep_temp(&mut report).await;
        report.temp_entries_deleted = swept;

        metrics::record_retention_deletions("local", report.local_deleted);
        metrics::record_retention_deletions("primary", report.primary_deleted);
        metrics::record_retention_deletions("secondary", report.secondary_deleted);
        metrics::record_retention_deletions("ledger", report.rows_deleted);
        metrics::record_retention_deletions("temp", report.temp_entries_deleted);

        info!(
            local_deleted = report.local_deleted,
            primary_deleted = report.primary_deleted,
            secondary_deleted = report.secondary_deleted,
            rows_deleted = report.rows_deleted,
            temp_entries_deleted = report.temp_entries_deleted,
            backend_failures = report.backend_failures,
            "Retention run finished"
        );

        if report.total_deletions() > 0 {
            let alert = Alert::new(
                AlertType::StorageCapacity,
                Severity::Info,
                format!("Retention removed {} expired items", report.total_deletions()),
            )
            .detail("local_deleted", report.local_deleted)
            .detail("primary_deleted", report.primary_deleted)
            .detail("secondary_deleted", report.secondary_deleted)
            .detail("rows_deleted", report.rows_deleted)
            .detail("temp_entries_deleted", report.temp_entries_deleted)
            .detail("backend_failures", report.backend_failures);
            self.ctx.alerts.notify(alert).await;
        }

        Ok(report)
    }

    /// Delete copies past their location's cutoff. Returns whether any
    /// locator was cleared.
    async fn expire_copies(
        &self,
        backup: &mut Backup,
        local_cutoff: DateTime<Utc>,
        cloud_cutoff: DateTime<Utc>,
        report: &mut RetentionReport,
    ) -> bool {
        let mut changed = false;

        for location in StorageLocation::ALL {
            let key = backup.locator(location).to_string();
            if key.is_empty() {
                continue;
            }
            let cutoff = if location.is_cloud() {
                cloud_cutoff
            } else {
                local_cutoff
            };
            if backup.created_at >= cutoff {
                continue;
            }

            match self.ctx.storage.delete(location, &key).await {
                Ok(removed) => {
                    if !removed {
                        debug!(backup_id = %backup.id, location = %location, key = %key, "Expired copy already gone");
                    }
                    backup.clear_locator(location);
                    report.count_copy(location);
                    changed = true;
                }
                Err(e) => {
                    warn!(backup_id = %backup.id, location = %location, error = %e, "Failed to delete expired copy");
                    report.backend_failures += 1;
                    report
                        .errors
                        .push(format!("{} {}: {}", backup.id, location, e));
                }
            }
        }

        changed
    }

    /// Remove entries of the temp directory older than the configured age
    async fn sweep_temp(&self, report: &mut RetentionReport) -> u64 {
        let temp_dir = &self.ctx.config.storage.temp_dir;
        let max_age = StdDuration::from_secs(self.ctx.config.retention.temp_max_age_hours * 3600);

        let mut entries = match tokio::fs::read_dir(temp_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                report.errors.push(format!("temp dir {}: {}", temp_dir.display(), e));
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    report.errors.push(format!("temp dir {}: {}", temp_dir.display(), e));
                    break;
                }
            };
            let path = entry.path();
            match is_stale(&path, max_age).await {
                Ok(false) => {}
                Ok(true) => match remove_entry(&path).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %path.display(), "Stale temp entry removed");
                    }
                    Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
                },
                Err(e) => report.errors.push(format!("{}: {}", path.display(), e)),
            }
        }
        removed
    }
}

async fn is_stale(path: &Path, max_age: StdDuration) -> std::io::Result<bool> {
    let modified = tokio::fs::metadata(path).await?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .map_or(false, |age| age > max_age))
}

async fn remove_entry(path: &Path) -> std::io::Result<()> {
    if tokio::fs::metadata(path).await?.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    }
}
