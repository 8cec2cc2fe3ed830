//! Typed job queue
//!
//! Every backup, restore, sweep and recovery runs as a job on a
//! [`JobQueue`]. Callers get a [`JobHandle`] back immediately and poll
//! [`JobStatus`] through the queue's registry.

pub mod queue;

pub use queue::{JobQueue, JobSlot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    Restore,
    DisasterRecovery,
    IntegritySweep,
    Retention,
    TestRestore,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
            Self::DisasterRecovery => "disaster_recovery",
            Self::IntegritySweep => "integrity_sweep",
            Self::Retention => "retention",
            Self::TestRestore => "test_restore",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Returned when a job is submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub kind: JobKind,
}

/// Registry entry for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// JSON rendering of the job's result
    pub output: Option<Value>,
}

impl JobRecord {
    fn queued(id: Uuid, kind: JobKind) -> Self {
        Self {
            id,
            kind,
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            output: None,
        }
    }
}
