// Integration tests for restores and the automated test restore
// Backups are produced by the real sealing codec so restores decrypt real artifacts

mod common;

use backup_dr::backup::{BackupEngine, BackupLocks, BackupRequest};
use backup_dr::ledger::{
    AlertType, Backup, BackupStatus, BackupType, Ledger, RestoreMode, RestoreStatus, Severity,
};
use backup_dr::restore::{RestoreEngine, RestoreRequest, TestRestoreRunner};
use backup_dr::storage::StorageLocation;
use backup_dr::tools::{ApplyMode, DumpScope};
use backup_dr::DrError;
use chrono::{Duration, Utc};
use common::{Harness, HarnessBuilder, DUMP_CONTENTS};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use uuid::Uuid;

async fn backup(h: &Harness, request: BackupRequest) -> Backup {
    BackupEngine::new(h.ctx.clone(), BackupLocks::new())
        .run(request)
        .await
        .expect("Failed to create backup")
}

async fn restore_logs(h: &Harness) -> Vec<backup_dr::ledger::RestoreLog> {
    h.ledger
        .list_restore_logs(None)
        .await
        .expect("Failed to list restore logs")
}

#[tokio::test]
async fn test_full_restore_round_trip() {
    // Backup then restore; the dump tool receives the original plaintext
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;

    let outcome = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::full(source.id).with_reason("drill"))
        .await
        .expect("Failed to restore");

    assert_eq!(outcome.source, StorageLocation::Primary);
    assert_eq!(outcome.restore_log.status, RestoreStatus::Completed);
    assert_eq!(outcome.restore_log.rows_restored, 2);
    assert_eq!(outcome.restore_log.mode, RestoreMode::Full);
    assert!(outcome.restore_log.completed_at.is_some());

    assert_eq!(h.dump_tool.restored_contents.lock()[0], DUMP_CONTENTS.to_vec());
    let restores = h.dump_tool.restores.lock().clone();
    assert_eq!(restores.len(), 1);
    assert_eq!(restores[0].0, h.ctx.config.database.url);
    assert_eq!(restores[0].1.apply, ApplyMode::Replace);

    let logs = restore_logs(&h).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RestoreStatus::Completed);
    assert_eq!(logs[0].reason, "drill");
}

#[tokio::test]
async fn test_restore_fails_over_between_locations() {
    // Primary down: secondary serves. Both down: local serves.
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    let engine = RestoreEngine::new(h.ctx.clone());

    h.primary.fail_downloads.store(true, Ordering::SeqCst);
    let outcome = engine
        .restore(&RestoreRequest::full(source.id))
        .await
        .expect("Failed to restore from secondary");
    assert_eq!(outcome.source, StorageLocation::Secondary);

    h.secondary.fail_downloads.store(true, Ordering::SeqCst);
    let outcome = engine
        .restore(&RestoreRequest::full(source.id))
        .await
        .expect("Failed to restore from local");
    assert_eq!(outcome.source, StorageLocation::Local);
}

#[tokio::test]
async fn test_restore_with_every_location_down_fails() {
    // No copy is reachable: the log ends FAILED with a CRITICAL alert
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    for backend in [&h.local, &h.primary, &h.secondary] {
        backend.fail_downloads.store(true, Ordering::SeqCst);
    }

    let err = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::full(source.id))
        .await
        .expect_err("Restore should fail");
    match &err {
        DrError::DownloadFailure { attempts } => assert_eq!(attempts.len(), 3),
        other => panic!("unexpected error: {}", other),
    }

    let logs = restore_logs(&h).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RestoreStatus::Failed);
    assert!(logs[0]
        .error_message
        .contains("Failed to download backup from any storage location"));

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::RestoreFailure);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].restore_log_id, Some(logs[0].id));
}

#[tokio::test]
async fn test_tampered_artifact_is_rejected() {
    // Primary copy corrupted in place; decryption must not accept it
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;

    let mut bytes = h
        .primary
        .inner
        .object(&source.primary_path)
        .expect("Failed to find primary object");
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    h.primary.inner.put_object(source.primary_path.clone(), bytes);

    let err = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::full(source.id))
        .await
        .expect_err("Restore should fail");
    assert!(matches!(err, DrError::Codec(_)));
    assert!(h.dump_tool.restores.lock().is_empty());
}

#[tokio::test]
async fn test_merge_restore_of_tenant_backup() {
    // Tenant restore in merge mode carries the tenant filter to the tool
    let h = HarnessBuilder::new().build();
    let tenant_id = Uuid::new_v4();
    let source = backup(&h, BackupRequest::tenant(tenant_id)).await;

    let outcome = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::merge(source.id).for_tenants(vec![tenant_id]))
        .await
        .expect("Failed to merge restore");

    assert_eq!(outcome.restore_log.mode, RestoreMode::Merge);
    assert_eq!(outcome.restore_log.tenant_ids, Some(vec![tenant_id]));
    let restores = h.dump_tool.restores.lock().clone();
    assert_eq!(restores[0].1.apply, ApplyMode::Merge);
    assert_eq!(restores[0].1.scope, DumpScope::Tenant(tenant_id));
    assert_eq!(restores[0].1.tenant_ids, Some(vec![tenant_id]));
}

#[tokio::test]
async fn test_tenant_restore_cannot_reach_other_tenants() {
    // A tenant dump only replaces its owner; naming other tenants is rejected
    let h = HarnessBuilder::new().build();
    let owner = Uuid::new_v4();
    let bystander = Uuid::new_v4();
    let source = backup(&h, BackupRequest::tenant(owner)).await;
    let engine = RestoreEngine::new(h.ctx.clone());

    let err = engine
        .restore(&RestoreRequest::full(source.id).for_tenants(vec![owner, bystander]))
        .await
        .expect_err("Restore should be rejected");
    assert!(matches!(err, DrError::InvalidRequest(_)));
    assert!(err.to_string().contains(&bystander.to_string()));
    assert!(h.dump_tool.restores.lock().is_empty());

    let logs = restore_logs(&h).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RestoreStatus::Failed);

    // Without a tenant filter the replace is still scoped to the owner
    engine
        .restore(&RestoreRequest::full(source.id))
        .await
        .expect("Failed to restore tenant backup");
    let restores = h.dump_tool.restores.lock().clone();
    assert_eq!(restores.len(), 1);
    assert_eq!(restores[0].1.apply, ApplyMode::Replace);
    assert_eq!(restores[0].1.scope, DumpScope::Tenant(owner));
}

#[tokio::test]
async fn test_preflight_rejects_invalid_requests() {
    // Each request is rejected before any download happens
    let h = HarnessBuilder::new().build();
    let full = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    let tenant_id = Uuid::new_v4();
    let tenant = backup(&h, BackupRequest::tenant(tenant_id)).await;
    let engine = RestoreEngine::new(h.ctx.clone());

    let mut failed = Backup::new(BackupType::FullDatabase, None, "failed.dump.gz.enc");
    failed.status = BackupStatus::Failed;
    h.ledger
        .insert_backup(&failed)
        .await
        .expect("Failed to insert failed backup");

    let rejected = [
        RestoreRequest::full(full.id).for_tenants(vec![tenant_id]),
        RestoreRequest::merge(tenant.id).for_tenants(Vec::new()),
        RestoreRequest::merge(tenant.id).for_tenants(vec![Uuid::new_v4()]),
        RestoreRequest::full(failed.id),
        RestoreRequest::point_in_time(full.id, Utc::now() + Duration::hours(1)),
        RestoreRequest::point_in_time(full.id, full.created_at - Duration::hours(1)),
        RestoreRequest::point_in_time(tenant.id, Utc::now()),
    ];

    for request in rejected {
        let err = engine
            .restore(&request)
            .await
            .expect_err("Request should be rejected");
        assert!(
            matches!(err, DrError::InvalidRequest(_)),
            "unexpected error for {:?}: {}",
            request,
            err
        );
    }
    assert!(h.dump_tool.restores.lock().is_empty());

    // Every rejected attempt is still on record
    let logs = restore_logs(&h).await;
    assert_eq!(logs.len(), 7);
    assert!(logs.iter().all(|log| log.status == RestoreStatus::Failed));
}

#[tokio::test]
async fn test_restore_of_unknown_backup_writes_nothing() {
    let h = HarnessBuilder::new().build();

    let err = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::full(Uuid::new_v4()))
        .await
        .expect_err("Restore should fail");
    assert!(err.to_string().contains("does not exist"));
    assert!(restore_logs(&h).await.is_empty());
}

#[tokio::test]
async fn test_point_in_time_restore_replays_wal() {
    // Base backup followed by a WAL archive that covers the target
    let h = HarnessBuilder::new().with_wal().build();
    let base = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    let target = base.created_at;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backup(&h, BackupRequest::new(BackupType::WalArchive)).await;

    let outcome = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::point_in_time(base.id, target))
        .await
        .expect("Failed to restore to point in time");

    assert_eq!(outcome.restore_log.mode, RestoreMode::Pitr);
    assert_eq!(outcome.restore_log.target_timestamp, Some(target));
    let wal = h.wal.as_ref().expect("Failed to find WAL archiver");
    assert_eq!(*wal.replays.lock(), vec![target]);
}

#[tokio::test]
async fn test_point_in_time_restore_needs_wal_coverage() {
    // No WAL archive reaches the target
    let h = HarnessBuilder::new().with_wal().build();
    let base = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let err = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::point_in_time(base.id, Utc::now()))
        .await
        .expect_err("Restore should fail");
    assert!(matches!(err, DrError::InvalidRequest(_)));
    assert!(err.to_string().contains("does not reach"));
}

#[tokio::test]
async fn test_automated_restore_without_backups() {
    // Nothing to restore: the report fails and a WARNING alert is raised
    let h = HarnessBuilder::new().build();

    let report = TestRestoreRunner::new(h.ctx.clone())
        .run()
        .await
        .expect("Failed to run test restore");

    assert!(!report.success);
    assert!(report.backup_id.is_none());
    assert!(report.errors[0].contains("No recent backups available"));
    assert!(h.admin.created.lock().is_empty());

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::RestoreTest);
    assert_eq!(alerts[0].severity, Severity::Warning);
    assert!(alerts[0].message.contains("No recent backups"));
}

#[tokio::test]
async fn test_automated_restore_checks_and_drops_database() {
    // Restore into a fresh database, run every check, drop it
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;

    let report = TestRestoreRunner::new(h.ctx.clone())
        .run()
        .await
        .expect("Failed to run test restore");

    assert!(report.success, "errors: {:?}", report.errors);
    assert_eq!(report.backup_id, Some(source.id));
    let names: Vec<&str> = report.integrity_checks.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["table_existence", "row_counts", "foreign_key_integrity", "data_corruption"]
    );

    let database = report.test_database.clone().expect("Failed to name test database");
    assert!(database.starts_with("dr_restore_test_"));
    assert_eq!(*h.admin.created.lock(), vec![database.clone()]);
    assert_eq!(*h.admin.dropped.lock(), vec![database.clone()]);

    // The restore went to the throwaway database, not the platform
    let restores = h.dump_tool.restores.lock().clone();
    assert_eq!(restores[0].0, format!("postgresql://fake/{}", database));

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::RestoreTest);
    assert_eq!(alerts[0].severity, Severity::Info);
}

#[tokio::test]
async fn test_automated_restore_reports_failed_check() {
    // Orphaned rows fail the foreign key check; the database is still dropped
    let h = HarnessBuilder::new().build();
    backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    h.admin
        .orphans
        .lock()
        .push("users.tenant_id -> tenants.id: 3 orphaned rows".to_string());

    let report = TestRestoreRunner::new(h.ctx.clone())
        .run()
        .await
        .expect("Failed to run test restore");

    assert!(!report.success);
    let fk = report
        .integrity_checks
        .iter()
        .find(|c| c.name == "foreign_key_integrity")
        .expect("Failed to find foreign key check");
    assert!(!fk.passed);
    assert_eq!(h.admin.dropped.lock().len(), 1);

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Error);
}

#[tokio::test]
async fn test_automated_restore_checks_core_tables_by_schema() {
    // Bare names resolve to `public`; a table in another schema must exist there
    let h = HarnessBuilder::new()
        .configure(|config| {
            config.test_restore.core_tables = vec![
                "tenants".to_string(),
                "public.users".to_string(),
                "billing.invoices".to_string(),
            ];
        })
        .build();
    backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;

    let report = TestRestoreRunner::new(h.ctx.clone())
        .run()
        .await
        .expect("Failed to run test restore");

    assert!(!report.success);
    let tables = report
        .integrity_checks
        .iter()
        .find(|c| c.name == "table_existence")
        .expect("Failed to find table check");
    assert!(!tables.passed);
    assert!(tables.detail.contains("billing.invoices"));
    assert!(!tables.detail.contains("tenants"));
    assert!(!tables.detail.contains("users"));
}

#[tokio::test]
async fn test_automated_restore_records_database_creation_failure() {
    // No database to restore into: a FAILED log and an ERROR alert remain
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    *h.admin.fail_create_with.lock() = Some("permission denied to create database".to_string());

    let report = TestRestoreRunner::new(h.ctx.clone())
        .run()
        .await
        .expect("Failed to run test restore");

    assert!(!report.success);
    assert!(report.errors[0].contains("permission denied"));
    assert!(h.admin.dropped.lock().is_empty());
    assert!(h.dump_tool.restores.lock().is_empty());

    let logs = restore_logs(&h).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].backup_id, source.id);
    assert_eq!(logs[0].status, RestoreStatus::Failed);
    assert!(logs[0].error_message.contains("permission denied"));
    assert_eq!(report.restore_log_id, Some(logs[0].id));

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::RestoreTest);
    assert_eq!(alerts[0].severity, Severity::Error);
}

#[tokio::test]
async fn test_unrecorded_completion_is_a_failed_restore() {
    // The dump applied but the COMPLETED write was lost: FAILED plus CRITICAL
    let h = HarnessBuilder::new().build();
    let source = backup(&h, BackupRequest::new(BackupType::FullDatabase)).await;
    h.ledger_faults
        .reject_completed_restores
        .store(true, Ordering::SeqCst);

    let err = RestoreEngine::new(h.ctx.clone())
        .restore(&RestoreRequest::full(source.id))
        .await
        .expect_err("Restore should fail");
    assert!(matches!(err, DrError::Ledger(_)));

    // Give any drop guard a chance to overwrite the row
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let logs = restore_logs(&h).await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, RestoreStatus::Failed);
    assert!(logs[0].error_message.contains("connection reset"));

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::RestoreFailure);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].restore_log_id, Some(logs[0].id));
}
