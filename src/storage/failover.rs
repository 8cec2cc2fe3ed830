//! Ordered download failover across the three storage locations
//!
//! Attempts are tracked explicitly: each candidate location moves from
//! `NotTried` to either `Failed` or `Succeeded`, and the first success ends
//! the walk. Candidates are taken in [`StorageLocation::DOWNLOAD_ORDER`] and
//! only locations with a recorded locator are tried.

use super::{StorageLocation, StorageSet};
use crate::ledger::Backup;
use crate::{DrError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// State of one candidate location
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AttemptState {
    NotTried,
    Failed(String),
    Succeeded,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverPlan {
    attempts: Vec<(StorageLocation, String, AttemptState)>,
}

impl FailoverPlan {
    /// Candidates for a backup: every location with a non-empty locator,
    /// primary first, local last.
    pub fn for_backup(backup: &Backup) -> Self {
        let attempts = StorageLocation::DOWNLOAD_ORDER
            .iter()
            .filter_map(|location| {
                let key = backup.locator(*location);
                (!key.is_empty()).then(|| (*location, key.to_string(), AttemptState::NotTried))
            })
            .collect();
        Self { attempts }
    }

    /// Next location still untried, unless a previous attempt succeeded
    pub fn next_candidate(&self) -> Option<(StorageLocation, String)> {
        if self.winner().is_some() {
            return None;
        }
        self.attempts
            .iter()
            .find(|(_, _, state)| *state == AttemptState::NotTried)
            .map(|(location, key, _)| (*location, key.clone()))
    }

    pub fn record_failure(&mut self, location: StorageLocation, reason: impl Into<String>) {
        self.set_state(location, AttemptState::Failed(reason.into()));
    }

    pub fn record_success(&mut self, location: StorageLocation) {
        self.set_state(location, AttemptState::Succeeded);
    }

    fn set_state(&mut self, location: StorageLocation, state: AttemptState) {
        if let Some(entry) = self.attempts.iter_mut().find(|(l, _, _)| *l == location) {
            entry.2 = state;
        }
    }

    pub fn winner(&self) -> Option<StorageLocation> {
        self.attempts
            .iter()
            .find(|(_, _, state)| *state == AttemptState::Succeeded)
            .map(|(location, _, _)| *location)
    }

    pub fn state(&self, location: StorageLocation) -> Option<&AttemptState> {
        self.attempts
            .iter()
            .find(|(l, _, _)| *l == location)
            .map(|(_, _, state)| state)
    }

    /// Human-readable summary of every failed attempt
    pub fn failures(&self) -> Vec<String> {
        self.attempts
            .iter()
            .filter_map(|(location, _, state)| match state {
                AttemptState::Failed(reason) => Some(format!("{}: {}", location, reason)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub path: PathBuf,
    pub source: StorageLocation,
    pub plan: FailoverPlan,
}

/// Download a backup artifact into `destination`, falling over from one
/// location to the next until one succeeds.
pub async fn download_with_failover(
    storage: &StorageSet,
    backup: &Backup,
    destination: &Path,
) -> Result<DownloadOutcome> {
    let mut plan = FailoverPlan::for_backup(backup);

    while let Some((location, key)) = plan.next_candidate() {
        match storage.download(location, &key, destination).await {
            Ok(true) => {
                plan.record_success(location);
                info!(backup_id = %backup.id, source = %location, "Backup downloaded");
            }
            Ok(false) => {
                warn!(backup_id = %backup.id, source = %location, "Backup object missing, failing over");
                plan.record_failure(location, "object not found");
            }
            Err(e) => {
                warn!(backup_id = %backup.id, source = %location, error = %e, "Download failed, failing over");
                plan.record_failure(location, e.to_string());
            }
        }
    }

    match plan.winner() {
        Some(source) => Ok(DownloadOutcome {
            path: destination.to_path_buf(),
            source,
            plan,
        }),
        None => Err(DrError::DownloadFailure {
            attempts: plan.failures(),
        }),
    }
}
