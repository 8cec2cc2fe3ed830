// Drop guards that keep ledger rows from being stranded IN_PROGRESS when the
// owning task is aborted between await points.

use super::{BackupStatus, Ledger, RestoreStatus};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::warn;
use uuid::Uuid;

const CANCELLED: &str = "cancelled";

/// Moves a Backup to FAILED ("cancelled") if dropped while armed
pub struct BackupGuard {
    ledger: Arc<dyn Ledger>,
    backup_id: Uuid,
    armed: bool,
}

impl BackupGuard {
    pub fn new(ledger: Arc<dyn Ledger>, backup_id: Uuid) -> Self {
        Self {
            ledger,
            backup_id,
            armed: true,
        }
    }

    /// The owner reached a terminal state itself
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for BackupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(backup_id = %self.backup_id, "No runtime to record cancelled backup");
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        let backup_id = self.backup_id;

        handle.spawn(async move {
            match ledger.get_backup(backup_id).await {
                Ok(Some(mut backup)) if backup.status == BackupStatus::InProgress => {
                    backup.status = BackupStatus::Failed;
                    backup.notes = CANCELLED.to_string();
                    if let Err(e) = ledger.update_backup(&backup).await {
                        warn!(backup_id = %backup_id, error = %e, "Failed to record cancelled backup");
                    } else {
                        warn!(backup_id = %backup_id, "Backup cancelled");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(backup_id = %backup_id, error = %e, "Failed to load cancelled backup"),
            }
        });
    }
}

/// Moves a RestoreLog to CANCELLED if dropped while armed
pub struct RestoreLogGuard {
    ledger: Arc<dyn Ledger>,
    restore_log_id: Uuid,
    armed: bool,
}

impl RestoreLogGuard {
    pub fn new(ledger: Arc<dyn Ledger>, restore_log_id: Uuid) -> Self {
        Self {
            ledger,
            restore_log_id,
            armed: true,
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for RestoreLogGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            warn!(restore_log_id = %self.restore_log_id, "No runtime to record cancelled restore");
            return;
        };
        let ledger = Arc::clone(&self.ledger);
        let restore_log_id = self.restore_log_id;

        handle.spawn(async move {
            match ledger.get_restore_log(restore_log_id).await {
                Ok(Some(mut log)) if log.status == RestoreStatus::InProgress => {
                    if log.cancel(CANCELLED).is_ok() {
                        if let Err(e) = ledger.update_restore_log(&log).await {
                            warn!(restore_log_id = %restore_log_id, error = %e, "Failed to record cancelled restore");
                        } else {
                            warn!(restore_log_id = %restore_log_id, "Restore cancelled");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(restore_log_id = %restore_log_id, error = %e, "Failed to load cancelled restore")
                }
            }
        });
    }
}
