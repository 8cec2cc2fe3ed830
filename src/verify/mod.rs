//! Cross-backend integrity verification
//!
//! [`check_locations`] inspects every location a backup is expected to occupy.
//! The backup pipeline runs it once right after upload (plus a hash of the
//! local copy) and [`IntegrityVerifier`] runs it periodically over recent
//! backups. Periodic sweeps only annotate `metadata.last_integrity_check`;
//! they never change a backup's status.

use crate::codec::sha256_file;
use crate::context::DrContext;
use crate::ledger::{Alert, AlertType, Backup, BackupQuery, Order, Severity};
use crate::monitoring::metrics;
use crate::storage::{StorageLocation, StorageSet};
use crate::Result;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of probing one location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LocationCheck {
    Healthy,
    /// The backup has no locator for an expected location
    MissingLocator,
    /// The locator points at nothing
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    BackendError(String),
}

impl LocationCheck {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingLocator | Self::Missing)
    }

    fn describe(&self, location: StorageLocation) -> Option<String> {
        match self {
            Self::Healthy => None,
            Self::MissingLocator => Some(format!("{}: no copy recorded", location)),
            Self::Missing => Some(format!("{}: file missing", location)),
            Self::SizeMismatch { expected, actual } => Some(format!(
                "{}: size mismatch (expected {} bytes, found {})",
                location, expected, actual
            )),
            Self::BackendError(message) => Some(format!("{}: backend error: {}", location, message)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub checks: Vec<(StorageLocation, LocationCheck)>,
}

impl LocationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|(_, check)| check.is_healthy())
    }

    pub fn any_healthy(&self) -> bool {
        self.checks.iter().any(|(_, check)| check.is_healthy())
    }

    pub fn errors(&self) -> Vec<String> {
        self.checks
            .iter()
            .filter_map(|(location, check)| check.describe(*location))
            .collect()
    }

    fn count(&self, predicate: impl Fn(&LocationCheck) -> bool) -> usize {
        self.checks.iter().filter(|(_, check)| predicate(check)).count()
    }
}

/// Query `exists` then `size` on every expected location of `backup`.
/// A backend error only fails that backend.
pub async fn check_locations(storage: &StorageSet, backup: &Backup) -> LocationReport {
    let mut checks = Vec::new();

    for location in StorageLocation::expected_for(backup.backup_type) {
        let key = backup.locator(*location);
        let check = if key.is_empty() {
            LocationCheck::MissingLocator
        } else {
            match storage.exists(*location, key).await {
                Ok(false) => LocationCheck::Missing,
                Err(e) => LocationCheck::BackendError(e.to_string()),
                Ok(true) => match storage.size(*location, key).await {
                    Ok(actual) if actual == backup.size_bytes => LocationCheck::Healthy,
                    Ok(actual) => LocationCheck::SizeMismatch {
                        expected: backup.size_bytes,
                        actual,
                    },
                    Err(e) => LocationCheck::BackendError(e.to_string()),
                },
            }
        };
        checks.push((*location, check));
    }

    LocationReport { checks }
}

/// Result of the post-upload cross-check
#[derive(Debug, Clone, PartialEq)]
pub struct CrossCheck {
    pub report: LocationReport,
    /// Problems found hashing the local copy
    pub hash_errors: Vec<String>,
}

impl CrossCheck {
    pub fn passed(&self) -> bool {
        self.report.passed() && self.hash_errors.is_empty()
    }

    pub fn errors(&self) -> Vec<String> {
        let mut errors = self.report.errors();
        errors.extend(self.hash_errors.iter().cloned());
        errors
    }
}

/// Location check plus a SHA-256 comparison of the local copy against
/// `expected_sha256`, when the backup has a local copy.
pub async fn cross_check(
    storage: &StorageSet,
    backup: &Backup,
    expected_sha256: &str,
    scratch: &Path,
) -> CrossCheck {
    let report = check_locations(storage, backup).await;
    let mut hash_errors = Vec::new();

    let local_healthy = report
        .checks
        .iter()
        .any(|(location, check)| *location == StorageLocation::Local && check.is_healthy());

    if local_healthy && !expected_sha256.is_empty() {
        let copy = scratch.join(format!("{}.check", backup.id));
        match storage
            .download(StorageLocation::Local, &backup.local_path, &copy)
            .await
        {
            Ok(true) => match sha256_file(&copy).await {
                Ok(actual) if actual == expected_sha256 => {}
                Ok(actual) => hash_errors.push(format!(
                    "local: checksum mismatch (expected {}, found {})",
                    expected_sha256, actual
                )),
                Err(e) => hash_errors.push(format!("local: failed to hash copy: {}", e)),
            },
            Ok(false) => hash_errors.push("local: copy vanished during hashing".to_string()),
            Err(e) => hash_errors.push(format!("local: failed to read copy: {}", e)),
        }
        let _ = tokio::fs::remove_file(&copy).await;
    }

    CrossCheck {
        report,
        hash_errors,
    }
}

/// One failing backup in a sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityFailure {
    pub backup_id: Uuid,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub verified_successfully: usize,
    pub missing_files: usize,
    pub storage_mismatches: usize,
    pub backend_errors: usize,
    pub integrity_failures: Vec<IntegrityFailure>,
}

/// Periodic sweep over recent backups
pub struct IntegrityVerifier {
    ctx: DrContext,
}

impl IntegrityVerifier {
    pub fn new(ctx: DrContext) -> Self {
        Self { ctx }
    }

    /// Check COMPLETED/VERIFIED backups from the configured window, oldest
    /// first, up to the configured cap.
    pub async fn run(&self) -> Result<IntegrityReport> {
        let settings = &self.ctx.config.integrity;
        let query = BackupQuery::default()
            .usable()
            .created_after(Utc::now() - Duration::days(settings.window_days))
            .order(Order::OldestFirst)
            .limit(settings.max_per_run);
        let backups = self.ctx.ledger.list_backups(&query).await?;

        info!(candidates = backups.len(), "Starting integrity sweep");
        let mut report = IntegrityReport::default();

        for mut backup in backups {
            let checks = check_locations(&self.ctx.storage, &backup).await;
            let passed = checks.passed();
            let errors = checks.errors();

            report.checked += 1;
            report.missing_files += checks.count(LocationCheck::is_missing);
            report.storage_mismatches +=
                checks.count(|c| matches!(c, LocationCheck::SizeMismatch { .. }));
            report.backend_errors += checks.count(|c| matches!(c, LocationCheck::BackendError(_)));
            metrics::record_integrity_check(passed);

            backup.metadata.insert(
                "last_integrity_check".to_string(),
                json!({
                    "status": if passed { "passed" } else { "failed" },
                    "errors": errors,
                    "checked_at": Utc::now(),
                }),
            );
            if let Err(e) = self.ctx.ledger.update_backup(&backup).await {
                warn!(backup_id = %backup.id, error = %e, "Failed to record integrity check");
            }

            if passed {
                report.verified_successfully += 1;
                continue;
            }

            let severity = if checks.any_healthy() {
                Severity::Warning
            } else {
                Severity::Error
            };
            let alert = Alert::new(
                AlertType::IntegrityFailure,
                severity,
                format!("Integrity check failed for backup {}", backup.filename),
            )
            .for_backup(backup.id)
            .detail("errors", errors.clone());
            self.ctx.alerts.notify(alert).await;

            report.integrity_failures.push(IntegrityFailure {
                backup_id: backup.id,
                errors,
            });
        }

        info!(
            checked = report.checked,
            verified = report.verified_successfully,
            missing_files = report.missing_files,
            storage_mismatches = report.storage_mismatches,
            backend_errors = report.backend_errors,
            failures = report.integrity_failures.len(),
            "Integrity sweep finished"
        );
        Ok(report)
    }
}
