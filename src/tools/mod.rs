//! External collaborators the pipeline drives but does not implement
//!
//! The database dump/restore tooling, WAL archiving, ephemeral database
//! administration and service infrastructure are reached through the traits
//! below. Implementations return `anyhow::Result`; engines map failures into
//! [`crate::DrError`] at the call site.

pub mod infra;
pub mod postgres;
pub mod wal;

pub use infra::CommandInfrastructure;
pub use postgres::{PgAdmin, PgDumpTool};
pub use wal::DirectoryWalArchiver;

use crate::ledger::BackupType;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

/// What a dump covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpScope {
    /// Every schema of the platform database
    Full,
    /// A single tenant's schema
    Tenant(Uuid),
    /// Platform configuration tables only
    Configuration,
}

impl DumpScope {
    /// Scope of a dump-based backup; `None` for WAL archives and for tenant
    /// backups without a tenant
    pub fn for_backup(backup_type: BackupType, tenant_id: Option<Uuid>) -> Option<Self> {
        match (backup_type, tenant_id) {
            (BackupType::FullDatabase, _) => Some(Self::Full),
            (BackupType::Configuration, _) => Some(Self::Configuration),
            (BackupType::TenantBackup, Some(tenant_id)) => Some(Self::Tenant(tenant_id)),
            (BackupType::TenantBackup, None) | (BackupType::WalArchive, _) => None,
        }
    }
}

/// How a dump is applied to the target database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyMode {
    /// Drop what is there and load the dump
    Replace,
    /// Keep existing rows; rows from the dump only fill gaps
    Merge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePlan {
    pub apply: ApplyMode,
    /// What the dump covers. REPLACE clears only this much of the target.
    pub scope: DumpScope,
    /// Restrict the restore to these tenants
    pub tenant_ids: Option<Vec<Uuid>>,
}

/// Dumps and restores the platform database
#[async_trait]
pub trait DumpTool: Send + Sync {
    /// Write a plaintext dump of `scope` to `output`
    async fn dump(&self, output: &Path, connection: &str, scope: DumpScope) -> Result<()>;

    /// Apply a plaintext dump; returns the number of rows restored
    async fn apply_restore(&self, input: &Path, connection: &str, plan: &RestorePlan) -> Result<u64>;
}

/// Summary of one WAL capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalCapture {
    pub segments: usize,
    pub last_segment: Option<String>,
}

/// Captures and replays write-ahead-log segments
#[async_trait]
pub trait WalArchiver: Send + Sync {
    /// Bundle segments archived after `since` into `output`
    async fn capture(&self, output: &Path, since: Option<DateTime<Utc>>) -> Result<WalCapture>;

    /// Replay a bundle against `connection`, stopping at `until`.
    /// Returns the number of segments applied.
    async fn replay(&self, input: &Path, connection: &str, until: DateTime<Utc>) -> Result<u64>;
}

/// Creates throwaway databases and checks their integrity
#[async_trait]
pub trait DatabaseAdmin: Send + Sync {
    /// Create an empty database and return its connection string
    async fn create_database(&self, name: &str) -> Result<String>;

    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Base tables as `schema.table`
    async fn list_tables(&self, connection: &str) -> Result<Vec<String>>;

    /// Row count per table
    async fn row_counts(&self, connection: &str) -> Result<Vec<(String, i64)>>;

    /// One entry per foreign key that has dangling references
    async fn orphaned_references(&self, connection: &str) -> Result<Vec<String>>;

    /// Structural problems such as invalid indexes
    async fn structural_problems(&self, connection: &str) -> Result<Vec<String>>;
}

/// Service-level operations used by the disaster recovery runbook
#[async_trait]
pub trait Infrastructure: Send + Sync {
    async fn restart_services(&self) -> Result<()>;

    /// One health check; `Ok(false)` means not healthy yet
    async fn health_check(&self) -> Result<bool>;

    async fn reroute_traffic(&self) -> Result<()>;
}
