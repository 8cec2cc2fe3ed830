// Post-run monitors evaluated after every successful backup

use super::AlertCenter;
use crate::config::MonitoringConfig;
use crate::ledger::{Alert, AlertType, Backup, BackupQuery, Ledger, Severity};
use crate::Result;

/// Samples used for the size baseline
const SIZE_BASELINE_SAMPLES: usize = 5;

/// Share of local capacity that triggers a capacity warning
const CAPACITY_WARNING_RATIO: f64 = 0.9;

/// Percent deviation of `actual` from the mean of `samples`; `None` when
/// there is no usable baseline.
pub fn size_deviation_percent(actual: u64, samples: &[u64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().sum::<u64>() as f64 / samples.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    Some(((actual as f64 - mean).abs() / mean) * 100.0)
}

/// Raise SIZE_DEVIATION, DURATION_THRESHOLD and STORAGE_CAPACITY warnings
/// for a freshly completed backup. Returns the alerts raised.
pub async fn run_post_backup_checks(
    ledger: &dyn Ledger,
    alerts: &AlertCenter,
    config: &MonitoringConfig,
    backup: &Backup,
) -> Result<Vec<Alert>> {
    let mut raised = Vec::new();

    let baseline = ledger
        .list_backups(
            &BackupQuery::of_type(backup.backup_type)
                .tenant(backup.tenant_id)
                .usable()
                .created_before(backup.created_at)
                .limit(SIZE_BASELINE_SAMPLES),
        )
        .await?;
    let samples: Vec<u64> = baseline
        .iter()
        .filter(|b| b.id != backup.id)
        .map(|b| b.size_bytes)
        .collect();

    if let Some(deviation) = size_deviation_percent(backup.size_bytes, &samples) {
        if deviation > config.size_deviation_percent {
            let mean = samples.iter().sum::<u64>() / samples.len() as u64;
            let alert = Alert::new(
                AlertType::SizeDeviation,
                Severity::Warning,
                format!(
                    "{} backup size {} bytes deviates {:.1}% from recent mean {} bytes",
                    backup.backup_type, backup.size_bytes, deviation, mean
                ),
            )
            .for_backup(backup.id)
            .detail("size_bytes", backup.size_bytes)
            .detail("baseline_mean_bytes", mean)
            .detail("deviation_percent", deviation)
            .detail("samples", samples.len());
            raised.push(alerts.raise(alert).await?);
        }
    }

    if let Some(duration) = backup.duration_seconds {
        if duration > config.duration_threshold_secs {
            let alert = Alert::new(
                AlertType::DurationThreshold,
                Severity::Warning,
                format!(
                    "{} backup took {:.1}s, threshold is {:.1}s",
                    backup.backup_type, duration, config.duration_threshold_secs
                ),
            )
            .for_backup(backup.id)
            .detail("duration_seconds", duration)
            .detail("threshold_seconds", config.duration_threshold_secs);
            raised.push(alerts.raise(alert).await?);
        }
    }

    if config.local_capacity_bytes > 0 {
        let used: u64 = ledger
            .list_backups(&BackupQuery::default())
            .await?
            .iter()
            .filter(|b| !b.local_path.is_empty())
            .map(|b| b.size_bytes)
            .sum();
        let limit = config.local_capacity_bytes as f64 * CAPACITY_WARNING_RATIO;
        if used as f64 > limit {
            let alert = Alert::new(
                AlertType::StorageCapacity,
                Severity::Warning,
                format!(
                    "Local backups use {} of {} bytes",
                    used, config.local_capacity_bytes
                ),
            )
            .for_backup(backup.id)
            .detail("used_bytes", used)
            .detail("capacity_bytes", config.local_capacity_bytes)
            .detail(
                "usage_percent",
                used as f64 / config.local_capacity_bytes as f64 * 100.0,
            );
            raised.push(alerts.raise(alert).await?);
        }
    }

    Ok(raised)
}
