//! backup-dr entry point.
//!
//! Wires the PostgreSQL ledger, the three storage locations and the
//! external tools together, then runs the scheduler until Ctrl-C.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use backup_dr::codec::SealingCodec;
use backup_dr::config::{DrConfig, ObjectStoreConfig};
use backup_dr::context::DrContext;
use backup_dr::ledger::{PostgresLedger, PostgresLedgerConfig};
use backup_dr::scheduler::Scheduler;
use backup_dr::service::DrService;
use backup_dr::storage::{LocalBackend, S3Backend, S3Config, StorageSet};
use backup_dr::tools::{CommandInfrastructure, DirectoryWalArchiver, PgAdmin, PgDumpTool};

fn s3_config(store: &ObjectStoreConfig) -> S3Config {
    S3Config {
        bucket_name: store.bucket.clone(),
        region: store.region.clone(),
        key_prefix: store.key_prefix.clone(),
        endpoint_url: store.endpoint_url.clone(),
        force_path_style: store.force_path_style,
        ..S3Config::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = DrConfig::from_env()?;
    tracing::info!(
        local_root = %config.storage.local_root.display(),
        primary_bucket = %config.storage.primary.bucket,
        secondary_bucket = %config.storage.secondary.bucket,
        "starting backup-dr"
    );

    let ledger = PostgresLedger::connect(PostgresLedgerConfig {
        database_url: config.database.url.clone(),
        max_connections: config.database.max_connections,
        min_connections: config.database.min_connections,
        connect_timeout_secs: config.database.connect_timeout_secs,
        ..PostgresLedgerConfig::default()
    })
    .await?;

    let storage = StorageSet::new(
        Arc::new(LocalBackend::new(config.storage.local_root.clone())),
        Arc::new(S3Backend::new("primary", s3_config(&config.storage.primary)).await),
        Arc::new(S3Backend::new("secondary", s3_config(&config.storage.secondary)).await),
    );

    let codec = SealingCodec::new(config.encryption_key.clone());
    let dump_tool = PgDumpTool::new(config.tools.pg_dump_bin.clone(), config.tools.psql_bin.clone());
    let admin = PgAdmin::connect(&config.database.admin_url).await?;
    let infrastructure = CommandInfrastructure::new(
        config.tools.restart_command.clone(),
        config.tools.health_command.clone(),
        config.tools.reroute_command.clone(),
    );
    let wal_archiver = config
        .tools
        .wal_archive_dir
        .clone()
        .map(|dir| DirectoryWalArchiver::new(dir, config.tools.wal_restore_dir.clone()));

    let mut ctx = DrContext::new(
        config,
        Arc::new(ledger),
        storage,
        Arc::new(codec),
        Arc::new(dump_tool),
        Arc::new(admin),
        Arc::new(infrastructure),
    );
    if let Some(archiver) = wal_archiver {
        ctx = ctx.with_wal_archiver(Arc::new(archiver));
    }

    let service = DrService::new(ctx);
    let scheduler = Scheduler::new(service).start();
    tracing::info!("scheduler running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    scheduler.shutdown().await;

    Ok(())
}
