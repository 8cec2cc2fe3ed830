// Job queue: mpsc intake, semaphore-bounded workers, DashMap registry

use super::{JobHandle, JobKind, JobRecord, JobStatus};
use crate::config::JobsConfig;
use crate::monitoring::metrics;
use crate::{DrError, Result};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type JobFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

struct QueuedJob {
    id: Uuid,
    kind: JobKind,
}

struct Shared {
    registry: DashMap<Uuid, JobRecord>,
    /// Work waiting for a worker; taken on dispatch or dropped on cancel
    pending: DashMap<Uuid, Mutex<JobFuture>>,
    running: DashMap<Uuid, AbortHandle>,
    finished: Notify,
}

impl Shared {
    fn update(&self, id: Uuid, f: impl FnOnce(&mut JobRecord)) {
        if let Some(mut record) = self.registry.get_mut(&id) {
            f(&mut record);
        }
    }

    fn finish(&self, id: Uuid, status: JobStatus, error: Option<String>, output: Option<Value>) {
        let mut kind = None;
        self.update(id, |record| {
            if record.status.is_terminal() {
                return;
            }
            record.status = status;
            record.finished_at = Some(Utc::now());
            record.error = error;
            record.output = output;
            kind = Some(record.kind);
        });
        if let Some(kind) = kind {
            metrics::record_job_finished(kind.as_str(), status.as_str());
        }
        self.finished.notify_waiters();
    }
}

/// A reserved place in the queue. Submitting into it cannot fail, so
/// callers can reserve before writing anything that a rejected job would
/// leave behind.
pub struct JobSlot {
    permit: mpsc::OwnedPermit<QueuedJob>,
    shared: Arc<Shared>,
    kind: JobKind,
}

impl JobSlot {
    pub fn submit<F>(self, work: F) -> JobHandle
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let kind = self.kind;
        self.shared.registry.insert(id, JobRecord::queued(id, kind));
        self.shared.pending.insert(id, Mutex::new(Box::pin(work)));
        self.permit.send(QueuedJob { id, kind });

        debug!(job_id = %id, kind = %kind, "Job queued");
        JobHandle { id, kind }
    }
}

/// Bounded queue of jobs executed by a fixed number of workers
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<QueuedJob>,
    shared: Arc<Shared>,
    capacity: usize,
}

impl JobQueue {
    /// Start the dispatcher. Must be called inside a tokio runtime.
    pub fn new(config: &JobsConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let shared = Arc::new(Shared {
            registry: DashMap::new(),
            pending: DashMap::new(),
            running: DashMap::new(),
            finished: Notify::new(),
        });

        tokio::spawn(Self::dispatch(
            receiver,
            Arc::new(Semaphore::new(config.workers.max(1))),
            Arc::clone(&shared),
        ));
        info!(workers = config.workers.max(1), capacity, "Job queue started");

        Self {
            sender,
            shared,
            capacity,
        }
    }

    /// Reserve a place for one job of `kind`. Fails when the queue is full
    /// or shut down.
    pub fn reserve(&self, kind: JobKind) -> Result<JobSlot> {
        let permit = self.sender.clone().try_reserve_owned().map_err(|e| {
            DrError::InvalidRequest(match e {
                mpsc::error::TrySendError::Full(_) => {
                    format!("job queue is full ({} pending)", self.capacity)
                }
                mpsc::error::TrySendError::Closed(_) => "job queue is shut down".to_string(),
            })
        })?;
        Ok(JobSlot {
            permit,
            shared: Arc::clone(&self.shared),
            kind,
        })
    }

    /// Enqueue `work`. Fails when the queue is full or shut down.
    pub fn submit<F>(&self, kind: JobKind, work: F) -> Result<JobHandle>
    where
        F: Future<Output = Result<Value>> + Send + 'static,
    {
        Ok(self.reserve(kind)?.submit(work))
    }

    async fn dispatch(
        mut receiver: mpsc::Receiver<QueuedJob>,
        semaphore: Arc<Semaphore>,
        shared: Arc<Shared>,
    ) {
        while let Some(job) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };

            let Some((_, work)) = shared.pending.remove(&job.id) else {
                debug!(job_id = %job.id, "Skipping cancelled job");
                continue;
            };

            let task = tokio::spawn(work.into_inner());
            shared.running.insert(job.id, task.abort_handle());
            shared.update(job.id, |record| {
                record.status = JobStatus::Running;
                record.started_at = Some(Utc::now());
            });
            metrics::record_job_started();

            let shared = Arc::clone(&shared);
            let (id, kind) = (job.id, job.kind);
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = task.await;
                shared.running.remove(&id);
                match outcome {
                    Ok(Ok(output)) => {
                        info!(job_id = %id, kind = %kind, "Job succeeded");
                        shared.finish(id, JobStatus::Succeeded, None, Some(output));
                    }
                    Ok(Err(e)) => {
                        warn!(job_id = %id, kind = %kind, error = %e, "Job failed");
                        shared.finish(id, JobStatus::Failed, Some(e.to_string()), None);
                    }
                    Err(e) if e.is_cancelled() => {
                        info!(job_id = %id, kind = %kind, "Job cancelled");
                        shared.finish(
                            id,
                            JobStatus::Cancelled,
                            Some(DrError::Cancelled(id).to_string()),
                            None,
                        );
                    }
                    Err(e) => {
                        warn!(job_id = %id, kind = %kind, error = %e, "Job panicked");
                        shared.finish(id, JobStatus::Failed, Some(DrError::Join(e).to_string()), None);
                    }
                }
            });
        }
        debug!("Job dispatcher stopped");
    }

    pub fn status(&self, id: Uuid) -> Option<JobRecord> {
        self.shared.registry.get(&id).map(|record| record.clone())
    }

    pub fn jobs(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self
            .shared
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|record| record.submitted_at);
        jobs
    }

    /// Cancel a queued or running job. Returns false for unknown or
    /// already finished jobs. A queued job's future is dropped before this
    /// returns.
    pub fn cancel(&self, id: Uuid) -> bool {
        if let Some((_, work)) = self.shared.pending.remove(&id) {
            drop(work);
            info!(job_id = %id, "Queued job cancelled");
            self.shared.finish(
                id,
                JobStatus::Cancelled,
                Some(DrError::Cancelled(id).to_string()),
                None,
            );
            return true;
        }
        match self.shared.running.get(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, id: Uuid) -> Option<JobRecord> {
        loop {
            let finished = self.shared.finished.notified();
            let record = self.status(id)?;
            if record.status.is_terminal() {
                return Some(record);
            }
            finished.await;
        }
    }
}
