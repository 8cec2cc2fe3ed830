//! Prometheus metrics for backups, restores and recovery drills
//!
//! Metrics live in a crate-private registry exported with [`gather_metrics`].

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use tracing::warn;

struct DrMetrics {
    registry: Registry,
    backups: IntCounterVec,
    backup_duration: HistogramVec,
    backup_size: GaugeVec,
    restores: IntCounterVec,
    integrity_checks: IntCounterVec,
    alerts: IntCounterVec,
    retention_deletions: IntCounterVec,
    last_rto: Gauge,
    jobs: IntCounterVec,
    active_jobs: IntGauge,
}

impl DrMetrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let backups = IntCounterVec::new(
            Opts::new("backup_dr_backups_total", "Backups by type and final status"),
            &["backup_type", "status"],
        )?;
        let backup_duration = HistogramVec::new(
            HistogramOpts::new("backup_dr_backup_duration_seconds", "Backup wall-clock duration")
                .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
            &["backup_type"],
        )?;
        let backup_size = GaugeVec::new(
            Opts::new("backup_dr_backup_size_bytes", "Size of the most recent artifact"),
            &["backup_type"],
        )?;
        let restores = IntCounterVec::new(
            Opts::new("backup_dr_restores_total", "Restores by mode and final status"),
            &["mode", "status"],
        )?;
        let integrity_checks = IntCounterVec::new(
            Opts::new("backup_dr_integrity_checks_total", "Per-backup integrity check results"),
            &["result"],
        )?;
        let alerts = IntCounterVec::new(
            Opts::new("backup_dr_alerts_total", "Alerts raised"),
            &["alert_type", "severity"],
        )?;
        let retention_deletions = IntCounterVec::new(
            Opts::new("backup_dr_retention_deletions_total", "Copies deleted by retention"),
            &["location"],
        )?;
        let last_rto = Gauge::new(
            "backup_dr_last_rto_seconds",
            "Recovery time of the most recent disaster recovery run",
        )?;
        let jobs = IntCounterVec::new(
            Opts::new("backup_dr_jobs_total", "Jobs by kind and final status"),
            &["kind", "status"],
        )?;
        let active_jobs = IntGauge::new("backup_dr_active_jobs", "Jobs currently running")?;

        registry.register(Box::new(backups.clone()))?;
        registry.register(Box::new(backup_duration.clone()))?;
        registry.register(Box::new(backup_size.clone()))?;
        registry.register(Box::new(restores.clone()))?;
        registry.register(Box::new(integrity_checks.clone()))?;
        registry.register(Box::new(alerts.clone()))?;
        registry.register(Box::new(retention_deletions.clone()))?;
        registry.register(Box::new(last_rto.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(active_jobs.clone()))?;

        Ok(Self {
            registry,
            backups,
            backup_duration,
            backup_size,
            restores,
            integrity_checks,
            alerts,
            retention_deletions,
            last_rto,
            jobs,
            active_jobs,
        })
    }
}

lazy_static! {
    static ref METRICS: Option<DrMetrics> = match DrMetrics::new() {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(error = %e, "Metrics registry unavailable");
            None
        }
    };
}

fn with_metrics(f: impl FnOnce(&DrMetrics)) {
    if let Some(metrics) = METRICS.as_ref() {
        f(metrics);
    }
}

pub fn record_backup(backup_type: &str, status: &str, duration_secs: f64, size_bytes: u64) {
    with_metrics(|m| {
        m.backups.with_label_values(&[backup_type, status]).inc();
        m.backup_duration
            .with_label_values(&[backup_type])
            .observe(duration_secs);
        if size_bytes > 0 {
            m.backup_size
                .with_label_values(&[backup_type])
                .set(size_bytes as f64);
        }
    });
}

pub fn record_restore(mode: &str, status: &str) {
    with_metrics(|m| m.restores.with_label_values(&[mode, status]).inc());
}

pub fn record_integrity_check(passed: bool) {
    let result = if passed { "passed" } else { "failed" };
    with_metrics(|m| m.integrity_checks.with_label_values(&[result]).inc());
}

pub fn record_alert(alert_type: &str, severity: &str) {
    with_metrics(|m| m.alerts.with_label_values(&[alert_type, severity]).inc());
}

pub fn record_retention_deletions(location: &str, count: u64) {
    if count > 0 {
        with_metrics(|m| {
            m.retention_deletions
                .with_label_values(&[location])
                .inc_by(count)
        });
    }
}

pub fn record_rto(seconds: f64) {
    with_metrics(|m| m.last_rto.set(seconds));
}

pub fn record_job_started() {
    with_metrics(|m| m.active_jobs.inc());
}

pub fn record_job_finished(kind: &str, status: &str) {
    with_metrics(|m| {
        m.active_jobs.dec();
        m.jobs.with_label_values(&[kind, status]).inc();
    });
}

/// Prometheus text exposition of every metric
pub fn gather_metrics() -> String {
    let Some(metrics) = METRICS.as_ref() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics.registry.gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
