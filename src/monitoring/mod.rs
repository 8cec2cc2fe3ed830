//! Alerts, metrics and post-run monitors
//!
//! Every component raises alerts through [`AlertCenter`], which persists
//! them in the ledger, mirrors them to the log at a matching level and
//! counts them.

pub mod checks;
pub mod metrics;

pub use metrics::gather_metrics;

use crate::ledger::{Alert, AlertQuery, AlertStatus, Ledger, Severity};
use crate::{DrError, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AlertCenter {
    ledger: Arc<dyn Ledger>,
    channels: Vec<String>,
}

impl AlertCenter {
    pub fn new(ledger: Arc<dyn Ledger>, channels: Vec<String>) -> Self {
        Self { ledger, channels }
    }

    /// Persist an alert
    pub async fn raise(&self, mut alert: Alert) -> Result<Alert> {
        if alert.notification_channels.is_empty() {
            alert.notification_channels = self.channels.clone();
        }

        match alert.severity {
            Severity::Info => info!(
                alert_type = %alert.alert_type,
                backup_id = ?alert.backup_id,
                restore_log_id = ?alert.restore_log_id,
                "{}", alert.message
            ),
            Severity::Warning => warn!(
                alert_type = %alert.alert_type,
                backup_id = ?alert.backup_id,
                restore_log_id = ?alert.restore_log_id,
                "{}", alert.message
            ),
            Severity::Error | Severity::Critical => error!(
                alert_type = %alert.alert_type,
                severity = %alert.severity,
                backup_id = ?alert.backup_id,
                restore_log_id = ?alert.restore_log_id,
                "{}", alert.message
            ),
        }

        self.ledger.insert_alert(&alert).await?;
        metrics::record_alert(alert.alert_type.as_str(), alert.severity.as_str());
        Ok(alert)
    }

    /// Raise on a failure path: a ledger error here is logged, never
    /// allowed to mask the failure being reported.
    pub async fn notify(&self, alert: Alert) {
        let alert_type = alert.alert_type;
        if let Err(e) = self.raise(alert).await {
            error!(alert_type = %alert_type, error = %e, "Failed to persist alert");
        }
    }

    pub async fn acknowledge(&self, alert_id: Uuid, operator: Uuid) -> Result<Alert> {
        let mut alert = self.load(alert_id).await?;
        alert.acknowledge(operator)?;
        self.ledger.update_alert(&alert).await?;
        info!(alert_id = %alert_id, operator = %operator, "Alert acknowledged");
        Ok(alert)
    }

    pub async fn resolve(&self, alert_id: Uuid) -> Result<Alert> {
        let mut alert = self.load(alert_id).await?;
        alert.resolve()?;
        self.ledger.update_alert(&alert).await?;
        info!(alert_id = %alert_id, "Alert resolved");
        Ok(alert)
    }

    pub async fn active(&self) -> Result<Vec<Alert>> {
        self.ledger
            .list_alerts(&AlertQuery {
                status: Some(AlertStatus::Active),
                ..AlertQuery::default()
            })
            .await
    }

    async fn load(&self, alert_id: Uuid) -> Result<Alert> {
        self.ledger
            .get_alert(alert_id)
            .await?
            .ok_or_else(|| DrError::InvalidRequest(format!("alert {} does not exist", alert_id)))
    }
}
