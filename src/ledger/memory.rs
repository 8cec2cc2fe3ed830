use super::{
    Alert, AlertQuery, Backup, BackupQuery, Ledger, Order, RestoreLog, WalArchivingConfig,
};
use crate::{DrError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use uuid::Uuid;

/// In-memory ledger
#[derive(Clone, Default)]
pub struct MemoryLedger {
    backups: Arc<DashMap<Uuid, Backup>>,
    restore_logs: Arc<DashMap<Uuid, RestoreLog>>,
    alerts: Arc<DashMap<Uuid, Alert>>,
    wal_config: Arc<RwLock<WalArchivingConfig>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every alert, oldest first (test convenience)
    pub fn all_alerts(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.alerts.iter().map(|e| e.value().clone()).collect();
        alerts.sort_by_key(|a| a.created_at);
        alerts
    }

    pub fn backup_count(&self) -> usize {
        self.backups.len()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn insert_backup(&self, backup: &Backup) -> Result<()> {
        if self.backups.contains_key(&backup.id) {
            return Err(DrError::Ledger(format!("backup {} already exists", backup.id)));
        }
        self.backups.insert(backup.id, backup.clone());
        Ok(())
    }

    async fn update_backup(&self, backup: &Backup) -> Result<()> {
        match self.backups.get_mut(&backup.id) {
            Some(mut entry) => {
                *entry = backup.clone();
                Ok(())
            }
            None => Err(DrError::BackupNotFound(backup.id)),
        }
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        Ok(self.backups.get(&id).map(|entry| entry.value().clone()))
    }

    async fn delete_backup(&self, id: Uuid) -> Result<bool> {
        Ok(self.backups.remove(&id).is_some())
    }

    async fn list_backups(&self, query: &BackupQuery) -> Result<Vec<Backup>> {
        let mut backups: Vec<Backup> = self
            .backups
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        match query.order {
            Order::NewestFirst => backups.sort_by(|a, b| b.created_at.cmp(&a.created_at)),
            Order::OldestFirst => backups.sort_by(|a, b| a.created_at.cmp(&b.created_at)),
        }
        if let Some(limit) = query.limit {
            backups.truncate(limit);
        }
        Ok(backups)
    }

    async fn insert_restore_log(&self, log: &RestoreLog) -> Result<()> {
        self.restore_logs.insert(log.id, log.clone());
        Ok(())
    }

    async fn update_restore_log(&self, log: &RestoreLog) -> Result<()> {
        match self.restore_logs.get_mut(&log.id) {
            Some(mut entry) => {
                *entry = log.clone();
                Ok(())
            }
            None => Err(DrError::RestoreLogNotFound(log.id)),
        }
    }

    async fn get_restore_log(&self, id: Uuid) -> Result<Option<RestoreLog>> {
        Ok(self.restore_logs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_restore_logs(&self, backup_id: Option<Uuid>) -> Result<Vec<RestoreLog>> {
        let mut logs: Vec<RestoreLog> = self
            .restore_logs
            .iter()
            .filter(|entry| backup_id.map_or(true, |id| entry.value().backup_id == id))
            .map(|entry| entry.value().clone())
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(logs)
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.alerts.insert(alert.id, alert.clone());
        Ok(())
    }

    async fn update_alert(&self, alert: &Alert) -> Result<()> {
        match self.alerts.get_mut(&alert.id) {
            Some(mut entry) => {
                *entry = alert.clone();
                Ok(())
            }
            None => Err(DrError::Ledger(format!("alert {} does not exist", alert.id))),
        }
    }

    async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        Ok(self.alerts.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_alerts(&self, query: &AlertQuery) -> Result<Vec<Alert>> {
        let mut alerts: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    async fn wal_config(&self) -> Result<WalArchivingConfig> {
        Ok(*self.wal_config.read())
    }

    async fn save_wal_config(&self, config: WalArchivingConfig) -> Result<()> {
        *self.wal_config.write() = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BackupStatus, BackupType};
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_list_backups_filters_orders_and_caps() {
        let ledger = MemoryLedger::new();
        for days_ago in [40, 20, 10, 1] {
            let mut backup = Backup::new(BackupType::FullDatabase, None, format!("b{}", days_ago));
            backup.created_at = Utc::now() - Duration::days(days_ago);
            backup.status = BackupStatus::Completed;
            ledger.insert_backup(&backup).await.unwrap();
        }
        let wal = Backup::new(BackupType::WalArchive, None, "wal");
        ledger.insert_backup(&wal).await.unwrap();

        let query = BackupQuery::of_type(BackupType::FullDatabase)
            .usable()
            .created_after(Utc::now() - Duration::days(30))
            .order(Order::OldestFirst)
            .limit(2);
        let found = ledger.list_backups(&query).await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].filename, "b20");
        assert_eq!(found[1].filename, "b10");
    }

    #[tokio::test]
    async fn test_update_of_unknown_backup_fails() {
        let ledger = MemoryLedger::new();
        let backup = Backup::new(BackupType::Configuration, None, "c");
        assert!(matches!(
            ledger.update_backup(&backup).await,
            Err(DrError::BackupNotFound(_))
        ));
    }
}
