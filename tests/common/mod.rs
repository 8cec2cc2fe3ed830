// Shared fakes for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use backup_dr::codec::{sha256_hex, ArtifactCodec, CodecError, SealedArtifact, SealingCodec};
use backup_dr::config::{DrConfig, EncryptionKey};
use backup_dr::context::DrContext;
use backup_dr::ledger::{
    Alert, AlertQuery, Backup, BackupQuery, Ledger, MemoryLedger, RestoreLog, RestoreStatus,
    WalArchivingConfig,
};
use backup_dr::DrError;
use backup_dr::storage::{MemoryBackend, StorageBackend, StorageError, StorageSet};
use backup_dr::tools::{DatabaseAdmin, DumpScope, DumpTool, Infrastructure, RestorePlan, WalArchiver, WalCapture};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

pub const DUMP_CONTENTS: &[u8] = b"INSERT INTO tenants VALUES ('acme');\nINSERT INTO users VALUES ('ada');\n";

/// Dump tool that writes fixed contents, or fails with a fixed message
#[derive(Default)]
pub struct FakeDumpTool {
    pub fail_with: Mutex<Option<String>>,
    pub fail_restore_with: Mutex<Option<String>>,
    /// Sleep before writing the dump
    pub delay: Mutex<Option<std::time::Duration>>,
    pub dumps: Mutex<Vec<DumpScope>>,
    pub restores: Mutex<Vec<(String, RestorePlan)>>,
    pub restored_contents: Mutex<Vec<Vec<u8>>>,
}

impl FakeDumpTool {
    pub fn failing(message: &str) -> Self {
        let tool = Self::default();
        *tool.fail_with.lock() = Some(message.to_string());
        tool
    }
}

#[async_trait]
impl DumpTool for FakeDumpTool {
    async fn dump(&self, output: &Path, _connection: &str, scope: DumpScope) -> anyhow::Result<()> {
        if let Some(message) = self.fail_with.lock().clone() {
            anyhow::bail!("pg_dump: error: connection to server failed: {}", message);
        }
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.dumps.lock().push(scope);
        tokio::fs::write(output, DUMP_CONTENTS).await?;
        Ok(())
    }

    async fn apply_restore(&self, input: &Path, connection: &str, plan: &RestorePlan) -> anyhow::Result<u64> {
        if let Some(message) = self.fail_restore_with.lock().clone() {
            anyhow::bail!("psql: {}", message);
        }
        let contents = tokio::fs::read(input).await?;
        self.restored_contents.lock().push(contents.clone());
        self.restores.lock().push((connection.to_string(), plan.clone()));
        Ok(contents.iter().filter(|b| **b == b'\n').count() as u64)
    }
}

/// Codec that skips real sealing: a fixed checksum and a 500000-byte artifact
pub struct StubCodec;

pub const STUB_CHECKSUM: &str = "abc123checksum";
pub const STUB_ARTIFACT_SIZE: usize = 500_000;

#[async_trait]
impl ArtifactCodec for StubCodec {
    async fn compress_and_encrypt(&self, input: &Path, output_dir: &Path) -> Result<SealedArtifact, CodecError> {
        let plaintext = tokio::fs::read(input).await?;
        let artifact = vec![7u8; STUB_ARTIFACT_SIZE];
        let path = output_dir.join("stub.dump.gz.enc");
        tokio::fs::write(&path, &artifact).await?;
        Ok(SealedArtifact {
            path,
            plaintext_sha256: STUB_CHECKSUM.to_string(),
            artifact_sha256: sha256_hex(&artifact),
            original_size: plaintext.len() as u64 * 10,
            compressed_size: artifact.len() as u64,
        })
    }

    async fn decrypt_and_decompress(&self, input: &Path, output_dir: &Path) -> Result<PathBuf, CodecError> {
        let path = output_dir.join("stub.dump");
        tokio::fs::copy(input, &path).await?;
        Ok(path)
    }
}

/// Memory backend with switchable faults
#[derive(Clone)]
pub struct FaultyBackend {
    pub inner: MemoryBackend,
    pub fail_uploads: Arc<AtomicBool>,
    pub fail_downloads: Arc<AtomicBool>,
    pub fail_deletes: Arc<AtomicBool>,
    /// Added to every reported size
    pub size_skew: Arc<AtomicUsize>,
}

impl FaultyBackend {
    pub fn new(name: &str) -> Self {
        Self {
            inner: MemoryBackend::new(name),
            fail_uploads: Arc::new(AtomicBool::new(false)),
            fail_downloads: Arc::new(AtomicBool::new(false)),
            fail_deletes: Arc::new(AtomicBool::new(false)),
            size_skew: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn remote_error(&self, what: &str) -> StorageError {
        StorageError::Remote {
            backend: self.inner.name().to_string(),
            message: format!("{} refused: service unavailable", what),
        }
    }
}

#[async_trait]
impl StorageBackend for FaultyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key).await
    }

    async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let size = self.inner.size(key).await?;
        Ok(size + self.size_skew.load(Ordering::SeqCst) as u64)
    }

    async fn upload(&self, local_file: &Path, key: &str) -> Result<bool, StorageError> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(self.remote_error("upload"));
        }
        self.inner.upload(local_file, key).await
    }

    async fn download(&self, key: &str, local_file: &Path) -> Result<bool, StorageError> {
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(self.remote_error("download"));
        }
        self.inner.download(key, local_file).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(self.remote_error("delete"));
        }
        self.inner.delete(key).await
    }
}

/// Database admin that hands out fake connection strings. Table names are
/// schema-qualified the way information_schema reports them.
pub struct FakeAdmin {
    pub fail_create_with: Mutex<Option<String>>,
    pub tables: Mutex<Vec<String>>,
    pub rows: Mutex<Vec<(String, i64)>>,
    pub orphans: Mutex<Vec<String>>,
    pub problems: Mutex<Vec<String>>,
    pub created: Mutex<Vec<String>>,
    pub dropped: Mutex<Vec<String>>,
}

impl Default for FakeAdmin {
    fn default() -> Self {
        Self {
            fail_create_with: Mutex::new(None),
            tables: Mutex::new(vec![
                "public.tenants".to_string(),
                "public.users".to_string(),
                "tenant_0a1b2c3d4e5f.items".to_string(),
            ]),
            rows: Mutex::new(vec![
                ("public.tenants".to_string(), 1),
                ("public.users".to_string(), 1),
            ]),
            orphans: Mutex::new(Vec::new()),
            problems: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DatabaseAdmin for FakeAdmin {
    async fn create_database(&self, name: &str) -> anyhow::Result<String> {
        if let Some(message) = self.fail_create_with.lock().clone() {
            anyhow::bail!("failed to create database {}: {}", name, message);
        }
        self.created.lock().push(name.to_string());
        Ok(format!("postgresql://fake/{}", name))
    }

    async fn drop_database(&self, name: &str) -> anyhow::Result<()> {
        self.dropped.lock().push(name.to_string());
        Ok(())
    }

    async fn list_tables(&self, _connection: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.tables.lock().clone())
    }

    async fn row_counts(&self, _connection: &str) -> anyhow::Result<Vec<(String, i64)>> {
        Ok(self.rows.lock().clone())
    }

    async fn orphaned_references(&self, _connection: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.orphans.lock().clone())
    }

    async fn structural_problems(&self, _connection: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.problems.lock().clone())
    }
}

pub struct FakeInfra {
    pub healthy: AtomicBool,
    pub restarts: AtomicUsize,
    pub health_checks: AtomicUsize,
    pub reroutes: AtomicUsize,
}

impl FakeInfra {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            restarts: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            reroutes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Infrastructure for FakeInfra {
    async fn restart_services(&self) -> anyhow::Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self) -> anyhow::Result<bool> {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self.healthy.load(Ordering::SeqCst))
    }

    async fn reroute_traffic(&self) -> anyhow::Result<()> {
        self.reroutes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// WAL archiver that bundles a fixed payload and records replays
#[derive(Default)]
pub struct FakeWalArchiver {
    pub replays: Mutex<Vec<DateTime<Utc>>>,
}

#[async_trait]
impl WalArchiver for FakeWalArchiver {
    async fn capture(&self, output: &Path, _since: Option<DateTime<Utc>>) -> anyhow::Result<WalCapture> {
        tokio::fs::write(output, b"WALBNDL1 segment payload").await?;
        Ok(WalCapture {
            segments: 1,
            last_segment: Some("000000010000000000000001".to_string()),
        })
    }

    async fn replay(&self, _input: &Path, _connection: &str, until: DateTime<Utc>) -> anyhow::Result<u64> {
        self.replays.lock().push(until);
        Ok(1)
    }
}

/// Memory ledger that can refuse to record completed restores
pub struct FaultyLedger {
    pub inner: Arc<MemoryLedger>,
    pub reject_completed_restores: AtomicBool,
}

impl FaultyLedger {
    pub fn new(inner: Arc<MemoryLedger>) -> Self {
        Self {
            inner,
            reject_completed_restores: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Ledger for FaultyLedger {
    async fn insert_backup(&self, backup: &Backup) -> backup_dr::Result<()> {
        self.inner.insert_backup(backup).await
    }

    async fn update_backup(&self, backup: &Backup) -> backup_dr::Result<()> {
        self.inner.update_backup(backup).await
    }

    async fn get_backup(&self, id: Uuid) -> backup_dr::Result<Option<Backup>> {
        self.inner.get_backup(id).await
    }

    async fn delete_backup(&self, id: Uuid) -> backup_dr::Result<bool> {
        self.inner.delete_backup(id).await
    }

    async fn list_backups(&self, query: &BackupQuery) -> backup_dr::Result<Vec<Backup>> {
        self.inner.list_backups(query).await
    }

    async fn insert_restore_log(&self, log: &RestoreLog) -> backup_dr::Result<()> {
        self.inner.insert_restore_log(log).await
    }

    async fn update_restore_log(&self, log: &RestoreLog) -> backup_dr::Result<()> {
        if log.status == RestoreStatus::Completed
            && self.reject_completed_restores.load(Ordering::SeqCst)
        {
            return Err(DrError::Ledger("connection reset by peer".to_string()));
        }
        self.inner.update_restore_log(log).await
    }

    async fn get_restore_log(&self, id: Uuid) -> backup_dr::Result<Option<RestoreLog>> {
        self.inner.get_restore_log(id).await
    }

    async fn list_restore_logs(&self, backup_id: Option<Uuid>) -> backup_dr::Result<Vec<RestoreLog>> {
        self.inner.list_restore_logs(backup_id).await
    }

    async fn insert_alert(&self, alert: &Alert) -> backup_dr::Result<()> {
        self.inner.insert_alert(alert).await
    }

    async fn update_alert(&self, alert: &Alert) -> backup_dr::Result<()> {
        self.inner.update_alert(alert).await
    }

    async fn get_alert(&self, id: Uuid) -> backup_dr::Result<Option<Alert>> {
        self.inner.get_alert(id).await
    }

    async fn list_alerts(&self, query: &AlertQuery) -> backup_dr::Result<Vec<Alert>> {
        self.inner.list_alerts(query).await
    }

    async fn wal_config(&self) -> backup_dr::Result<WalArchivingConfig> {
        self.inner.wal_config().await
    }

    async fn save_wal_config(&self, config: WalArchivingConfig) -> backup_dr::Result<()> {
        self.inner.save_wal_config(config).await
    }
}

/// Everything a test needs to poke at
pub struct Harness {
    pub ctx: DrContext,
    pub ledger: Arc<MemoryLedger>,
    /// The ledger the context writes through; wraps `ledger`
    pub ledger_faults: Arc<FaultyLedger>,
    pub local: FaultyBackend,
    pub primary: FaultyBackend,
    pub secondary: FaultyBackend,
    pub dump_tool: Arc<FakeDumpTool>,
    pub admin: Arc<FakeAdmin>,
    pub infra: Arc<FakeInfra>,
    pub wal: Option<Arc<FakeWalArchiver>>,
    pub temp_dir: PathBuf,
}

pub fn test_config() -> DrConfig {
    let mut config = DrConfig::default();
    config.storage.temp_dir = std::env::temp_dir().join(format!("backup-dr-test-{}", Uuid::new_v4().simple()));
    config.storage.call_timeout_secs = 5;
    config.encryption_key = EncryptionKey::new([42u8; 32]);
    config.dr.health_check_budget_secs = 0;
    config.dr.health_poll_interval_secs = 1;
    config.jobs.workers = 2;
    config
}

pub struct HarnessBuilder {
    config: DrConfig,
    codec: Arc<dyn ArtifactCodec>,
    dump_tool: FakeDumpTool,
    healthy: bool,
    wal: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        let config = test_config();
        let codec = Arc::new(SealingCodec::new(config.encryption_key.clone()));
        Self {
            config,
            codec,
            dump_tool: FakeDumpTool::default(),
            healthy: true,
            wal: false,
        }
    }

    pub fn stub_codec(mut self) -> Self {
        self.codec = Arc::new(StubCodec);
        self
    }

    pub fn dump_tool(mut self, dump_tool: FakeDumpTool) -> Self {
        self.dump_tool = dump_tool;
        self
    }

    pub fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    pub fn with_wal(mut self) -> Self {
        self.wal = true;
        self
    }

    pub fn configure(mut self, f: impl FnOnce(&mut DrConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn build(self) -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let ledger_faults = Arc::new(FaultyLedger::new(ledger.clone()));
        let local = FaultyBackend::new("local");
        let primary = FaultyBackend::new("primary");
        let secondary = FaultyBackend::new("secondary");
        let storage = StorageSet::new(
            Arc::new(local.clone()),
            Arc::new(primary.clone()),
            Arc::new(secondary.clone()),
        );
        let dump_tool = Arc::new(self.dump_tool);
        let admin = Arc::new(FakeAdmin::default());
        let infra = Arc::new(FakeInfra::new(self.healthy));
        let temp_dir = self.config.storage.temp_dir.clone();

        let mut ctx = DrContext::new(
            self.config,
            ledger_faults.clone(),
            storage,
            self.codec,
            dump_tool.clone(),
            admin.clone(),
            infra.clone(),
        );
        let wal = self.wal.then(|| Arc::new(FakeWalArchiver::default()));
        if let Some(archiver) = &wal {
            ctx = ctx.with_wal_archiver(archiver.clone());
        }

        Harness {
            ctx,
            ledger,
            ledger_faults,
            local,
            primary,
            secondary,
            dump_tool,
            admin,
            infra,
            wal,
            temp_dir,
        }
    }
}

pub fn harness() -> Harness {
    HarnessBuilder::new().build()
}
