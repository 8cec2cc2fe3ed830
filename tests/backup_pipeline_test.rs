// Integration tests for the backup pipeline
// Uses the in-memory ledger and storage backends with fake database tooling

mod common;

use backup_dr::backup::{BackupEngine, BackupLocks, BackupRequest};
use backup_dr::ledger::{
    AlertType, Backup, BackupQuery, BackupStatus, BackupType, Ledger, Severity,
};
use backup_dr::storage::StorageLocation;
use backup_dr::tools::DumpScope;
use backup_dr::DrError;
use common::{FakeDumpTool, HarnessBuilder, STUB_ARTIFACT_SIZE, STUB_CHECKSUM};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;
use uuid::Uuid;

fn engine(h: &common::Harness) -> BackupEngine {
    BackupEngine::new(h.ctx.clone(), BackupLocks::new())
}

async fn only_backup(h: &common::Harness) -> Backup {
    let backups = h
        .ledger
        .list_backups(&BackupQuery::default())
        .await
        .expect("Failed to list backups");
    assert_eq!(backups.len(), 1);
    backups.into_iter().next().expect("Failed to find backup")
}

#[tokio::test]
async fn test_successful_backup_is_verified() {
    // Dump, seal and upload succeed everywhere and the cross-check passes
    let h = HarnessBuilder::new().stub_codec().build();

    let backup = engine(&h)
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect("Failed to run backup");

    assert_eq!(backup.status, BackupStatus::Verified);
    assert_eq!(backup.checksum, STUB_CHECKSUM);
    assert_eq!(backup.size_bytes, STUB_ARTIFACT_SIZE as u64);
    assert!(backup.duration_seconds.is_some());
    assert!(backup.compression_ratio.is_some());
    assert!(backup.verified_at.is_some());
    for location in StorageLocation::ALL {
        assert!(!backup.locator(location).is_empty(), "{} locator missing", location);
    }
    assert_eq!(h.local.inner.len(), 1);
    assert_eq!(h.primary.inner.len(), 1);
    assert_eq!(h.secondary.inner.len(), 1);

    // The ledger holds the same terminal record
    let stored = only_backup(&h).await;
    assert_eq!(stored.status, BackupStatus::Verified);
    assert_eq!(stored.size_bytes, STUB_ARTIFACT_SIZE as u64);
    assert!(h.ledger.all_alerts().is_empty());
}

#[tokio::test]
async fn test_dump_failure_marks_backup_failed() {
    // pg_dump cannot reach the server
    let h = HarnessBuilder::new()
        .dump_tool(FakeDumpTool::failing("Connection refused"))
        .build();

    let err = engine(&h)
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect_err("Backup should fail");
    assert!(matches!(err, DrError::DumpFailure(_)));
    assert!(err.to_string().contains("Connection refused"));

    let stored = only_backup(&h).await;
    assert_eq!(stored.status, BackupStatus::Failed);
    assert!(stored.notes.contains("Connection refused"));
    assert!(stored.duration_seconds.is_some());

    // Exactly one CRITICAL failure alert
    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::BackupFailure);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].backup_id, Some(stored.id));
}

#[tokio::test]
async fn test_partial_upload_fails_backup_but_keeps_locators() {
    // Secondary object store rejects the upload
    let h = HarnessBuilder::new().stub_codec().build();
    h.secondary.fail_uploads.store(true, Ordering::SeqCst);

    let err = engine(&h)
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect_err("Backup should fail");
    assert!(matches!(err, DrError::UploadFailure(_)));
    assert!(err.to_string().contains("secondary"));

    let stored = only_backup(&h).await;
    assert_eq!(stored.status, BackupStatus::Failed);
    assert!(!stored.local_path.is_empty());
    assert!(!stored.primary_path.is_empty());
    assert!(stored.secondary_path.is_empty());

    let failures: Vec<_> = h
        .ledger
        .all_alerts()
        .into_iter()
        .filter(|a| a.alert_type == AlertType::BackupFailure)
        .collect();
    assert_eq!(failures.len(), 1);
}

#[tokio::test]
async fn test_cross_check_mismatch_leaves_backup_completed() {
    // Primary reports a size that differs from what was uploaded
    let h = HarnessBuilder::new().stub_codec().build();
    h.primary.size_skew.store(1, Ordering::SeqCst);

    let backup = engine(&h)
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect("Failed to run backup");

    assert_eq!(backup.status, BackupStatus::Completed);
    assert!(backup.verified_at.is_none());

    let alerts = h.ledger.all_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::IntegrityFailure);
    assert_eq!(alerts[0].severity, Severity::Warning);
}

#[tokio::test]
async fn test_tenant_backup_requires_tenant() {
    // Rejected before anything reaches the ledger
    let h = HarnessBuilder::new().build();

    let err = engine(&h)
        .run(BackupRequest::new(BackupType::TenantBackup))
        .await
        .expect_err("Request should be rejected");
    assert!(matches!(err, DrError::InvalidRequest(_)));

    let err = engine(&h)
        .run(BackupRequest::new(BackupType::FullDatabase).for_tenant(Uuid::new_v4()))
        .await
        .expect_err("Request should be rejected");
    assert!(matches!(err, DrError::InvalidRequest(_)));

    assert_eq!(h.ledger.backup_count(), 0);
    assert!(h.ledger.all_alerts().is_empty());
}

#[tokio::test]
async fn test_tenant_backup_dumps_tenant_scope() {
    // The dump is restricted to the requested tenant
    let h = HarnessBuilder::new().build();
    let tenant_id = Uuid::new_v4();

    let backup = engine(&h)
        .run(BackupRequest::tenant(tenant_id).with_notes("before migration"))
        .await
        .expect("Failed to run tenant backup");

    assert_eq!(backup.status, BackupStatus::Verified);
    assert_eq!(backup.tenant_id, Some(tenant_id));
    assert!(backup.filename.starts_with("tenant_backup_"));
    assert!(backup.filename.contains(&tenant_id.simple().to_string()));
    assert_eq!(backup.notes, "before migration");
    assert_eq!(*h.dump_tool.dumps.lock(), vec![DumpScope::Tenant(tenant_id)]);
}

#[tokio::test]
async fn test_concurrent_backup_of_same_scope_is_rejected() {
    // A held lock blocks a second run for the same type and tenant
    let h = HarnessBuilder::new().build();
    let locks = BackupLocks::new();
    let engine = BackupEngine::new(h.ctx.clone(), locks.clone());

    let held = locks
        .acquire(BackupType::FullDatabase, None, Uuid::new_v4())
        .expect("Failed to acquire lock");

    let err = engine
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect_err("Second backup should be rejected");
    assert!(matches!(err, DrError::BackupInProgress { .. }));
    assert_eq!(h.ledger.backup_count(), 0);

    // Other scopes are unaffected
    engine
        .run(BackupRequest::new(BackupType::Configuration))
        .await
        .expect("Failed to run configuration backup");

    drop(held);
    assert!(!locks.is_held(BackupType::FullDatabase, None));
    engine
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect("Failed to run backup after lock release");
}

#[tokio::test]
async fn test_wal_archive_skips_local_storage() {
    // WAL bundles only go to the object stores
    let h = HarnessBuilder::new().with_wal().build();

    let backup = engine(&h)
        .run(BackupRequest::new(BackupType::WalArchive))
        .await
        .expect("Failed to archive WAL");

    assert_eq!(backup.status, BackupStatus::Verified);
    assert!(backup.local_path.is_empty());
    assert!(!backup.primary_path.is_empty());
    assert!(!backup.secondary_path.is_empty());
    assert!(h.local.inner.is_empty());
    assert_eq!(backup.metadata.get("wal_segments"), Some(&serde_json::json!(1)));
}

#[tokio::test]
async fn test_wal_archive_requires_archiver() {
    let h = HarnessBuilder::new().build();

    let err = engine(&h)
        .run(BackupRequest::new(BackupType::WalArchive))
        .await
        .expect_err("WAL archive should be rejected");
    assert!(matches!(err, DrError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_size_deviation_raises_warning() {
    // Recent backups were far smaller than this one
    let h = HarnessBuilder::new().stub_codec().build();
    for _ in 0..3 {
        let mut previous = Backup::new(BackupType::FullDatabase, None, "previous.dump.gz.enc");
        previous.status = BackupStatus::Verified;
        previous.size_bytes = 1_000;
        previous.set_locator(StorageLocation::Local, "backups/full_database/previous.dump.gz.enc");
        h.ledger
            .insert_backup(&previous)
            .await
            .expect("Failed to insert baseline backup");
    }

    let backup = engine(&h)
        .run(BackupRequest::new(BackupType::FullDatabase))
        .await
        .expect("Failed to run backup");
    assert_eq!(backup.status, BackupStatus::Verified);

    let deviations: Vec<_> = h
        .ledger
        .all_alerts()
        .into_iter()
        .filter(|a| a.alert_type == AlertType::SizeDeviation)
        .collect();
    assert_eq!(deviations.len(), 1);
    assert_eq!(deviations[0].severity, Severity::Warning);
    assert_eq!(deviations[0].backup_id, Some(backup.id));
}
