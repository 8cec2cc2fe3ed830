//! The ledger: durable Backup, RestoreLog and Alert records plus the WAL
//! configuration singleton. It is the system's audit trail.

mod guard;
mod memory;
pub mod postgres;
pub mod types;

pub use guard::{BackupGuard, RestoreLogGuard};
pub use memory::MemoryLedger;
pub use postgres::{PostgresLedger, PostgresLedgerConfig};
pub use types::*;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Sort order for backup listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Filter for backup listings. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BackupQuery {
    pub backup_type: Option<BackupType>,
    pub tenant_id: Option<Uuid>,
    pub statuses: Vec<BackupStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub order: Order,
    pub limit: Option<usize>,
}

impl BackupQuery {
    pub fn of_type(backup_type: BackupType) -> Self {
        Self {
            backup_type: Some(backup_type),
            ..Self::default()
        }
    }

    pub fn tenant(mut self, tenant_id: Option<Uuid>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    pub fn statuses(mut self, statuses: &[BackupStatus]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn usable(self) -> Self {
        self.statuses(&[BackupStatus::Completed, BackupStatus::Verified])
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// In-memory evaluation of the filter, shared by ledger implementations
    /// that cannot push it down.
    pub fn matches(&self, backup: &Backup) -> bool {
        if let Some(backup_type) = self.backup_type {
            if backup.backup_type != backup_type {
                return false;
            }
        }
        if self.tenant_id.is_some() && backup.tenant_id != self.tenant_id {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&backup.status) {
            return false;
        }
        if let Some(after) = self.created_after {
            if backup.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if backup.created_at >= before {
                return false;
            }
        }
        true
    }
}

/// Filter for alert listings
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub alert_type: Option<AlertType>,
    pub severity: Option<Severity>,
    pub status: Option<AlertStatus>,
    pub backup_id: Option<Uuid>,
    pub restore_log_id: Option<Uuid>,
}

impl AlertQuery {
    pub fn matches(&self, alert: &Alert) -> bool {
        self.alert_type.map_or(true, |t| alert.alert_type == t)
            && self.severity.map_or(true, |s| alert.severity == s)
            && self.status.map_or(true, |s| alert.status == s)
            && self.backup_id.map_or(true, |id| alert.backup_id == Some(id))
            && self
                .restore_log_id
                .map_or(true, |id| alert.restore_log_id == Some(id))
    }
}

/// Persistence for ledger records
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn insert_backup(&self, backup: &Backup) -> Result<()>;

    async fn update_backup(&self, backup: &Backup) -> Result<()>;

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>>;

    async fn delete_backup(&self, id: Uuid) -> Result<bool>;

    async fn list_backups(&self, query: &BackupQuery) -> Result<Vec<Backup>>;

    async fn insert_restore_log(&self, log: &RestoreLog) -> Result<()>;

    async fn update_restore_log(&self, log: &RestoreLog) -> Result<()>;

    async fn get_restore_log(&self, id: Uuid) -> Result<Option<RestoreLog>>;

    async fn list_restore_logs(&self, backup_id: Option<Uuid>) -> Result<Vec<RestoreLog>>;

    async fn insert_alert(&self, alert: &Alert) -> Result<()>;

    async fn update_alert(&self, alert: &Alert) -> Result<()>;

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>>;

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>>;

    async fn wal_config(&self) -> Result<WalArchivingConfig>;

    async fn save_wal_config(&self, config: WalArchivingConfig) -> Result<()>;
}
