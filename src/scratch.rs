//! Per-run scratch directories under the configured temp dir.
//!
//! Dumps, sealed artifacts and downloads live in a [`ScratchDir`] that is
//! removed when the guard drops, on success, error and cancellation alike.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<root>/<label>-<uuid>`
    pub async fn create(root: &Path, label: &str) -> std::io::Result<Self> {
        let path = root.join(format!("{}-{}", label, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory"),
        }
    }
}
