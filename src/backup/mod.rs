//! The backup pipeline
//!
//! A run dumps the database (or captures WAL segments), seals the dump,
//! uploads the artifact to every expected storage location and cross-checks
//! the copies. See [`BackupEngine::run`] for the exact stages.

pub mod engine;
pub mod naming;

pub use engine::{BackupEngine, BackupRequest};
pub use naming::{backup_filename, dump_filename};

use crate::ledger::BackupType;
use crate::{DrError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

type LockKey = (BackupType, Option<Uuid>);

/// One running backup per (type, tenant)
#[derive(Clone, Default)]
pub struct BackupLocks {
    held: Arc<DashMap<LockKey, Uuid>>,
}

impl BackupLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `backup_type`/`tenant_id`, or fail with
    /// `BackupInProgress` when another run holds it.
    pub fn acquire(
        &self,
        backup_type: BackupType,
        tenant_id: Option<Uuid>,
        backup_id: Uuid,
    ) -> Result<BackupLock> {
        let key = (backup_type, tenant_id);
        match self.held.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DrError::BackupInProgress {
                backup_type,
                scope: match tenant_id {
                    Some(tenant_id) => format!("tenant {}", tenant_id),
                    None => "the platform".to_string(),
                },
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(backup_id);
                Ok(BackupLock {
                    held: Arc::clone(&self.held),
                    key,
                })
            }
        }
    }

    pub fn is_held(&self, backup_type: BackupType, tenant_id: Option<Uuid>) -> bool {
        self.held.contains_key(&(backup_type, tenant_id))
    }
}

/// Released on drop
pub struct BackupLock {
    held: Arc<DashMap<LockKey, Uuid>>,
    key: LockKey,
}

impl Drop for BackupLock {
    fn drop(&mut self) {
        self.held.remove(&self.key);
    }
}
