//! # backup-dr
//!
//! Automated backup, integrity verification and disaster recovery for a
//! multi-tenant PostgreSQL platform.
//!
//! ## Overview
//!
//! Every backup is dumped, compressed, encrypted and written to three
//! independent locations (local disk plus a primary and a secondary object
//! store). A periodic sweep cross-checks those copies, restores download with
//! ordered failover, and a timed runbook brings the platform back after a
//! disaster while recording the achieved recovery time.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backup_dr::config::DrConfig;
//! use backup_dr::ledger::BackupType;
//! use backup_dr::service::{BackupRequest, DrService};
//!
//! # async fn example(service: DrService) -> backup_dr::Result<()> {
//! let handle = service.trigger_backup(BackupRequest::new(BackupType::FullDatabase))?;
//! let status = service.job_status(handle.id);
//! println!("{:?}", status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`storage`]: the three storage locations and download failover
//! - [`ledger`]: Backup, RestoreLog and Alert records
//! - [`codec`]: artifact compression and encryption
//! - [`tools`]: dump, WAL, database admin and infrastructure collaborators
//! - [`backup`]: the backup pipeline
//! - [`verify`]: cross-backend integrity checks
//! - [`restore`]: restore engine and automated test restores
//! - [`dr`]: the disaster recovery runbook
//! - [`retention`]: ageing out copies and orphaned rows
//! - [`jobs`]: the job queue every unit of work runs on
//! - [`service`]: the trigger surface used by operators and schedulers

use thiserror::Error;
use uuid::Uuid;

/// Result type for backup and recovery operations
pub type Result<T> = std::result::Result<T, DrError>;

/// Main error type for backup and recovery operations
#[derive(Error, Debug)]
pub enum DrError {
    /// The dump (or WAL capture) step failed
    #[error("Dump failed: {0}")]
    DumpFailure(String),

    /// At least one expected storage location rejected the artifact
    #[error("Upload failed: {0}")]
    UploadFailure(String),

    /// Checksums or sizes disagree
    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// Every candidate storage location failed. Per-location detail is
    /// carried in `attempts`.
    #[error("Failed to download backup from any storage location")]
    DownloadFailure { attempts: Vec<String> },

    /// Applying a restore failed
    #[error("Restore failed: {0}")]
    RestoreFailure(String),

    /// No backup satisfies the selection criteria
    #[error("No backup available: {0}")]
    NoBackupAvailable(String),

    /// Request rejected before any work was done
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Backup {0} does not exist")]
    BackupNotFound(Uuid),

    #[error("Restore log {0} does not exist")]
    RestoreLogNotFound(Uuid),

    /// A backup of the same type and tenant is already running
    #[error("A {backup_type} backup is already in progress for {scope}")]
    BackupInProgress {
        backup_type: ledger::BackupType,
        scope: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Restart, health check or traffic reroute failed
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Job {0} was cancelled")]
    Cancelled(Uuid),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DrError {
    /// Stable label for metrics and alert details
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DumpFailure(_) => "dump_failure",
            Self::UploadFailure(_) => "upload_failure",
            Self::IntegrityMismatch(_) => "integrity_mismatch",
            Self::DownloadFailure { .. } => "download_failure",
            Self::RestoreFailure(_) => "restore_failure",
            Self::NoBackupAvailable(_) => "no_backup_available",
            Self::InvalidRequest(_) => "invalid_request",
            Self::BackupNotFound(_) => "backup_not_found",
            Self::RestoreLogNotFound(_) => "restore_log_not_found",
            Self::BackupInProgress { .. } => "backup_in_progress",
            Self::Storage(_) => "storage",
            Self::Codec(_) => "codec",
            Self::Ledger(_) => "ledger",
            Self::Infrastructure(_) => "infrastructure",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Database(_) => "database",
            Self::Join(_) => "join",
            Self::Cancelled(_) => "cancelled",
            Self::Config(_) => "config",
        }
    }
}

/// Storage locations, backends and download failover
pub mod storage;

/// Ledger records and persistence
pub mod ledger;

/// Artifact compression and encryption
pub mod codec;

/// External collaborators: dump tool, WAL archiver, database admin, infrastructure
pub mod tools;

/// Alert center, metrics and post-run monitors
pub mod monitoring;

/// Backup pipeline
pub mod backup;

/// Integrity verification
pub mod verify;

/// Restore engine and automated test restores
pub mod restore;

/// Disaster recovery runbook
pub mod dr;

/// Retention and cleanup
pub mod retention;

/// Job queue
pub mod jobs;

/// Process configuration
pub mod config;

/// Shared wiring handed to every engine
pub mod context;

/// Temporary file tracking
pub mod scratch;

/// Trigger surface for operators and schedulers
pub mod service;

/// Interval loops that enqueue recurring jobs
pub mod scheduler;
