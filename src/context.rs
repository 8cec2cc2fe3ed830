use crate::codec::ArtifactCodec;
use crate::config::DrConfig;
use crate::ledger::Ledger;
use crate::monitoring::AlertCenter;
use crate::storage::StorageSet;
use crate::tools::{DatabaseAdmin, DumpTool, Infrastructure, WalArchiver};
use std::sync::Arc;

/// Everything an engine needs, cheap to clone into spawned jobs
#[derive(Clone)]
pub struct DrContext {
    pub config: Arc<DrConfig>,
    pub ledger: Arc<dyn Ledger>,
    pub storage: StorageSet,
    pub codec: Arc<dyn ArtifactCodec>,
    pub dump_tool: Arc<dyn DumpTool>,
    pub wal_archiver: Option<Arc<dyn WalArchiver>>,
    pub admin: Arc<dyn DatabaseAdmin>,
    pub infrastructure: Arc<dyn Infrastructure>,
    pub alerts: AlertCenter,
}

impl DrContext {
    pub fn new(
        config: DrConfig,
        ledger: Arc<dyn Ledger>,
        storage: StorageSet,
        codec: Arc<dyn ArtifactCodec>,
        dump_tool: Arc<dyn DumpTool>,
        admin: Arc<dyn DatabaseAdmin>,
        infrastructure: Arc<dyn Infrastructure>,
    ) -> Self {
        let alerts = AlertCenter::new(
            Arc::clone(&ledger),
            config.monitoring.notification_channels.clone(),
        );
        let storage = storage.with_call_timeout(config.storage.call_timeout());
        Self {
            config: Arc::new(config),
            ledger,
            storage,
            codec,
            dump_tool,
            wal_archiver: None,
            admin,
            infrastructure,
            alerts,
        }
    }

    pub fn with_wal_archiver(mut self, archiver: Arc<dyn WalArchiver>) -> Self {
        self.wal_archiver = Some(archiver);
        self
    }
}
