// Ledger record types - Backup, RestoreLog, Alert and the WAL configuration singleton

use crate::storage::StorageLocation;
use crate::{DrError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares an enum persisted as an upper-case string column
macro_rules! ledger_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DrError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(DrError::Ledger(format!(
                        "unknown {} value: {}", stringify!($name), other
                    ))),
                }
            }
        }
    };
}

ledger_enum!(
    /// What a backup artifact contains
    BackupType {
        FullDatabase => "FULL_DATABASE",
        TenantBackup => "TENANT_BACKUP",
        WalArchive => "WAL_ARCHIVE",
        Configuration => "CONFIGURATION",
    }
);

ledger_enum!(BackupStatus {
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Verified => "VERIFIED",
});

ledger_enum!(RestoreMode {
    Full => "FULL",
    Merge => "MERGE",
    Pitr => "PITR",
});

ledger_enum!(RestoreStatus {
    InProgress => "IN_PROGRESS",
    Completed => "COMPLETED",
    Failed => "FAILED",
    Cancelled => "CANCELLED",
});

ledger_enum!(AlertType {
    BackupFailure => "BACKUP_FAILURE",
    SizeDeviation => "SIZE_DEVIATION",
    DurationThreshold => "DURATION_THRESHOLD",
    StorageCapacity => "STORAGE_CAPACITY",
    IntegrityFailure => "INTEGRITY_FAILURE",
    RestoreFailure => "RESTORE_FAILURE",
    RestoreTest => "RESTORE_TEST",
});

ledger_enum!(Severity {
    Info => "INFO",
    Warning => "WARNING",
    Error => "ERROR",
    Critical => "CRITICAL",
});

ledger_enum!(AlertStatus {
    Active => "ACTIVE",
    Acknowledged => "ACKNOWLEDGED",
    Resolved => "RESOLVED",
});

impl BackupStatus {
    /// Completed or verified: the artifact is usable for restores
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Completed | Self::Verified)
    }
}

impl RestoreStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

/// One physical backup artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub backup_type: BackupType,
    pub tenant_id: Option<Uuid>,
    pub filename: String,
    pub size_bytes: u64,
    pub checksum: String,
    pub local_path: String,
    pub primary_path: String,
    pub secondary_path: String,
    pub status: BackupStatus,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub compression_ratio: Option<f64>,
    pub notes: String,
    pub metadata: Map<String, Value>,
    pub initiated_by: Option<Uuid>,
}

impl Backup {
    pub fn new(backup_type: BackupType, tenant_id: Option<Uuid>, filename: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_type,
            tenant_id,
            filename: filename.into(),
            size_bytes: 0,
            checksum: String::new(),
            local_path: String::new(),
            primary_path: String::new(),
            secondary_path: String::new(),
            status: BackupStatus::InProgress,
            created_at: Utc::now(),
            verified_at: None,
            duration_seconds: None,
            compression_ratio: None,
            notes: String::new(),
            metadata: Map::new(),
            initiated_by: None,
        }
    }

    pub fn locator(&self, location: StorageLocation) -> &str {
        match location {
            StorageLocation::Local => &self.local_path,
            StorageLocation::Primary => &self.primary_path,
            StorageLocation::Secondary => &self.secondary_path,
        }
    }

    pub fn set_locator(&mut self, location: StorageLocation, key: impl Into<String>) {
        let key = key.into();
        match location {
            StorageLocation::Local => self.local_path = key,
            StorageLocation::Primary => self.primary_path = key,
            StorageLocation::Secondary => self.secondary_path = key,
        }
    }

    pub fn clear_locator(&mut self, location: StorageLocation) {
        self.set_locator(location, String::new());
    }

    pub fn has_any_locator(&self) -> bool {
        StorageLocation::ALL
            .iter()
            .any(|location| !self.locator(*location).is_empty())
    }

    /// Check the record-level invariants the ledger must never violate
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        if self.status.is_usable() {
            if self.size_bytes == 0 {
                return Err(format!("backup {} is {} with zero size", self.id, self.status));
            }
            if !self.has_any_locator() {
                return Err(format!("backup {} is {} without any locator", self.id, self.status));
            }
        }
        if self.backup_type == BackupType::WalArchive && !self.local_path.is_empty() {
            return Err(format!("WAL archive {} has a local copy", self.id));
        }
        Ok(())
    }
}

/// One restore or disaster-recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreLog {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub initiated_by: Option<Uuid>,
    pub mode: RestoreMode,
    pub tenant_ids: Option<Vec<Uuid>>,
    pub target_timestamp: Option<DateTime<Utc>>,
    pub status: RestoreStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: String,
    pub rows_restored: u64,
    pub duration_seconds: Option<f64>,
    pub reason: String,
}

impl RestoreLog {
    pub fn new(
        backup_id: Uuid,
        mode: RestoreMode,
        initiated_by: Option<Uuid>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            backup_id,
            initiated_by,
            mode,
            tenant_ids: None,
            target_timestamp: None,
            status: RestoreStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            error_message: String::new(),
            rows_restored: 0,
            duration_seconds: None,
            reason: reason.into(),
        }
    }

    pub fn with_tenants(mut self, tenant_ids: Option<Vec<Uuid>>) -> Self {
        self.tenant_ids = tenant_ids;
        self
    }

    pub fn with_target_timestamp(mut self, target: Option<DateTime<Utc>>) -> Self {
        self.target_timestamp = target;
        self
    }

    /// A log leaves IN_PROGRESS exactly once
    fn finish(&mut self, status: RestoreStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(DrError::Ledger(format!(
                "restore log {} is already {}",
                self.id, self.status
            )));
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn complete(&mut self, rows_restored: u64, duration_seconds: f64) -> Result<()> {
        self.finish(RestoreStatus::Completed)?;
        self.rows_restored = rows_restored;
        self.duration_seconds = Some(duration_seconds);
        Ok(())
    }

    pub fn fail(&mut self, error_message: impl Into<String>, duration_seconds: f64) -> Result<()> {
        self.finish(RestoreStatus::Failed)?;
        self.error_message = error_message.into();
        self.duration_seconds = Some(duration_seconds);
        Ok(())
    }

    pub fn cancel(&mut self, error_message: impl Into<String>) -> Result<()> {
        self.finish(RestoreStatus::Cancelled)?;
        self.error_message = error_message.into();
        Ok(())
    }
}

/// Operational notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub backup_id: Option<Uuid>,
    pub restore_log_id: Option<Uuid>,
    pub message: String,
    pub details: Map<String, Value>,
    pub notification_channels: Vec<String>,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<Uuid>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    pub fn new(alert_type: AlertType, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            backup_id: None,
            restore_log_id: None,
            message: message.into(),
            details: Map::new(),
            notification_channels: Vec::new(),
            status: AlertStatus::Active,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
        }
    }

    pub fn for_backup(mut self, backup_id: Uuid) -> Self {
        self.backup_id = Some(backup_id);
        self
    }

    pub fn for_restore_log(mut self, restore_log_id: Uuid) -> Self {
        self.restore_log_id = Some(restore_log_id);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn acknowledge(&mut self, operator: Uuid) -> Result<()> {
        if self.status != AlertStatus::Active {
            return Err(DrError::InvalidRequest(format!(
                "alert {} is {}, only ACTIVE alerts can be acknowledged",
                self.id, self.status
            )));
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(operator);
        Ok(())
    }

    pub fn resolve(&mut self) -> Result<()> {
        if self.status != AlertStatus::Acknowledged {
            return Err(DrError::InvalidRequest(format!(
                "alert {} is {}, only ACKNOWLEDGED alerts can be resolved",
                self.id, self.status
            )));
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }
}

/// WAL archiving interval singleton. Deserializing goes through
/// [`WalArchivingConfig::new`], so the bounds hold for every instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawWalArchivingConfig")]
pub struct WalArchivingConfig {
    archive_interval_seconds: u64,
}

#[derive(Deserialize)]
struct RawWalArchivingConfig {
    archive_interval_seconds: u64,
}

impl TryFrom<RawWalArchivingConfig> for WalArchivingConfig {
    type Error = DrError;

    fn try_from(raw: RawWalArchivingConfig) -> Result<Self> {
        Self::new(raw.archive_interval_seconds)
    }
}

impl WalArchivingConfig {
    pub const MIN_INTERVAL_SECONDS: u64 = 300;
    pub const MAX_INTERVAL_SECONDS: u64 = 86_400;

    pub fn new(archive_interval_seconds: u64) -> Result<Self> {
        if !(Self::MIN_INTERVAL_SECONDS..=Self::MAX_INTERVAL_SECONDS)
            .contains(&archive_interval_seconds)
        {
            return Err(DrError::InvalidRequest(format!(
                "WAL archiving interval must be between {} and {} seconds, got {}",
                Self::MIN_INTERVAL_SECONDS,
                Self::MAX_INTERVAL_SECONDS,
                archive_interval_seconds
            )));
        }
        Ok(Self {
            archive_interval_seconds,
        })
    }

    pub fn archive_interval_seconds(&self) -> u64 {
        self.archive_interval_seconds
    }
}

impl Default for WalArchivingConfig {
    fn default() -> Self {
        Self {
            archive_interval_seconds: 3600,
        }
    }
}
