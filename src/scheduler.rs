//! Recurring jobs
//!
//! One loop per recurring operation, each submitting to the service's job
//! queue on its own interval. The WAL loop re-reads the archiving interval
//! from the ledger before every sleep so operator changes apply without a
//! restart.

use crate::config::ScheduleConfig;
use crate::jobs::JobHandle;
use crate::ledger::BackupType;
use crate::service::{BackupRequest, DrService};
use crate::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Scheduler {
    service: DrService,
    schedule: ScheduleConfig,
}

/// Running scheduler loops
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop every loop and wait for them to exit. Jobs already queued
    /// keep running.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Scheduler loop ended abnormally");
            }
        }
        info!("Scheduler stopped");
    }
}

impl Scheduler {
    pub fn new(service: DrService) -> Self {
        let schedule = service.context().config.schedule.clone();
        Self { service, schedule }
    }

    pub fn start(self) -> SchedulerHandle {
        let (shutdown, watcher) = watch::channel(false);
        let mut loops = Vec::new();

        let every = |secs: u64| Duration::from_secs(secs.max(1));
        let jobs: [(&'static str, Duration, fn(&DrService) -> Result<JobHandle>); 4] = [
            ("full_backup", every(self.schedule.full_backup_interval_secs), |s| {
                s.trigger_backup(BackupRequest::new(BackupType::FullDatabase))
            }),
            ("integrity_sweep", every(self.schedule.integrity_interval_secs), |s| {
                s.trigger_integrity_sweep()
            }),
            ("retention", every(self.schedule.retention_interval_secs), |s| {
                s.trigger_retention()
            }),
            ("test_restore", every(self.schedule.test_restore_interval_secs), |s| {
                s.trigger_test_restore()
            }),
        ];

        for (name, period, trigger) in jobs {
            loops.push(tokio::spawn(interval_loop(
                name,
                period,
                self.service.clone(),
                watcher.clone(),
                trigger,
            )));
        }

        if self.service.context().wal_archiver.is_some() {
            loops.push(tokio::spawn(wal_loop(self.service.clone(), watcher)));
        }

        info!(loops = loops.len(), "Scheduler started");
        SchedulerHandle { shutdown, loops }
    }
}

async fn interval_loop(
    name: &'static str,
    period: Duration,
    service: DrService,
    mut shutdown: watch::Receiver<bool>,
    trigger: fn(&DrService) -> Result<JobHandle>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately; wait a full period instead
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => submit(name, &service, trigger),
            _ = shutdown.changed() => break,
        }
    }
    debug!(job = name, "Scheduler loop stopped");
}

async fn wal_loop(service: DrService, mut shutdown: watch::Receiver<bool>) {
    loop {
        let interval = match service.wal_config().await {
            Ok(config) => config.archive_interval_seconds(),
            Err(e) => {
                warn!(error = %e, "Failed to read WAL interval, using default");
                crate::ledger::WalArchivingConfig::default().archive_interval_seconds()
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {
                submit("wal_archive", &service, |s| {
                    s.trigger_backup(BackupRequest::new(BackupType::WalArchive))
                });
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!(job = "wal_archive", "Scheduler loop stopped");
}

fn submit(name: &str, service: &DrService, trigger: fn(&DrService) -> Result<JobHandle>) {
    match trigger(service) {
        Ok(handle) => info!(job = name, job_id = %handle.id, "Scheduled job submitted"),
        Err(e) => warn!(job = name, error = %e, "Failed to submit scheduled job"),
    }
}
