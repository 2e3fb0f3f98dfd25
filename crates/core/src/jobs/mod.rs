//! Single-consumer FIFO queue for user-triggered mutations.
//!
//! Every job is persisted as `queued` before it is handed to the worker, and
//! each status transition is written back to `job_runs`, so status lookups
//! keep working after a restart. Jobs that were in flight at shutdown are not
//! resumed.

pub mod mutations;

pub use mutations::SectorMutations;

use crate::domain::job::{JobRecord, JobStatus};
use crate::storage::jobs as job_store;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Finished records kept in memory; older ones are served from `job_runs`.
pub const DEFAULT_RETAINED_JOBS: usize = 1024;
const CANCELLED_MESSAGE: &str = "cancelled: job queue stopped";

pub type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'static>>;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("timed out after {timeout:?} waiting for job {id}")]
    Timeout { id: String, timeout: Duration },
    #[error("job not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

struct QueuedJob {
    id: String,
    work: JobFuture,
}

/// State shared between the queue handle and its worker task.
struct Shared {
    pool: SqlitePool,
    records: Mutex<HashMap<String, JobRecord>>,
    /// Job the worker is currently awaiting.
    current: Mutex<Option<(String, AbortHandle)>>,
    retained: usize,
}

pub struct JobQueue {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<QueuedJob>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobQueue {
    /// Jobs enqueued before [`JobQueue::start`] wait in the channel.
    pub fn new(pool: SqlitePool) -> Self {
        Self::with_retained(pool, DEFAULT_RETAINED_JOBS)
    }

    /// Keeps at most `retained` finished records in memory.
    pub fn with_retained(pool: SqlitePool, retained: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                pool,
                records: Mutex::new(HashMap::new()),
                current: Mutex::new(None),
                retained,
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker task. Returns false if it was already started; a
    /// stopped queue cannot be restarted.
    pub fn start(&self) -> bool {
        let Some(rx) = self.rx.lock().take() else {
            return false;
        };
        let handle = tokio::spawn(run_worker(self.shared.clone(), rx));
        *self.worker.lock() = Some(handle);
        tracing::info!("job worker started");
        true
    }

    /// Aborts the worker and the job it is running. That job is marked
    /// failed; jobs still waiting in the channel stay queued.
    pub fn stop(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        handle.abort();
        let current = self.shared.current.lock().take();
        if let Some((id, job)) = current {
            job.abort();
            let cancelled = self.shared.mark_finished(&id, Err(CANCELLED_MESSAGE.to_string()));
            if let (Some(record), Ok(runtime)) = (cancelled, tokio::runtime::Handle::try_current()) {
                let shared = self.shared.clone();
                runtime.spawn(async move { shared.persist(&record).await });
            }
            tracing::warn!(job_id = %id, "in-flight job cancelled");
        }
        tracing::info!("job worker stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Records the job as queued, then hands it to the worker. Returns the job id.
    pub async fn enqueue<F>(
        &self,
        kind: &str,
        meta: serde_json::Value,
        work: F,
    ) -> Result<String, JobError>
    where
        F: Future<Output = anyhow::Result<String>> + Send + 'static,
    {
        let record = JobRecord::queued(kind, meta);
        let id = record.id.clone();
        job_store::insert_job(&self.shared.pool, &record).await?;
        self.shared.records.lock().insert(id.clone(), record);

        let job = QueuedJob {
            id: id.clone(),
            work: Box::pin(work),
        };
        if self.tx.send(job).is_err() {
            tracing::warn!(job_id = %id, kind, "job queue closed; marking job failed");
            self.shared.finish(&id, Err("job queue is stopped".to_string())).await;
        } else {
            tracing::debug!(job_id = %id, kind, "job enqueued");
        }
        Ok(id)
    }

    /// In-memory state first, then the durable record.
    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, JobError> {
        let cached = self.shared.records.lock().get(id).cloned();
        if cached.is_some() {
            return Ok(cached);
        }
        Ok(job_store::load_job(&self.shared.pool, id).await?)
    }

    /// Polls until the job reaches a terminal status. Timing out leaves the
    /// job running.
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<JobRecord, JobError> {
        let poll = async {
            loop {
                match self.get(id).await? {
                    Some(record) if record.status.is_terminal() => return Ok(record),
                    Some(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
                    None => return Err(JobError::NotFound(id.to_string())),
                }
            }
        };
        match tokio::time::timeout(timeout, poll).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout {
                id: id.to_string(),
                timeout,
            }),
        }
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_worker(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<QueuedJob>) {
    while let Some(QueuedJob { id, work }) = rx.recv().await {
        let started = Utc::now();
        let running = {
            let mut records = shared.records.lock();
            records.get_mut(&id).map(|record| {
                record.status = JobStatus::Running;
                record.started = Some(started);
                record.clone()
            })
        };
        if let Some(record) = running {
            shared.persist(&record).await;
            tracing::info!(job_id = %id, kind = %record.kind, "job started");
        }

        // Run on its own task so a panicking job only fails itself.
        let task = tokio::spawn(work);
        *shared.current.lock() = Some((id.clone(), task.abort_handle()));
        let outcome = match task.await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(join) => Err(format!("job task aborted: {join}")),
        };
        shared.current.lock().take();
        shared.finish(&id, outcome).await;
    }
    tracing::debug!("job channel closed; worker exiting");
}

impl Shared {
    /// Sets the terminal status in memory and trims old finished records.
    fn mark_finished(&self, id: &str, outcome: Result<String, String>) -> Option<JobRecord> {
        let mut records = self.records.lock();
        let record = records.get_mut(id)?;
        record.ended = Some(Utc::now());
        match outcome {
            Ok(message) => {
                record.status = JobStatus::Succeeded;
                record.message = Some(message);
            }
            Err(error) => {
                record.status = JobStatus::Failed;
                record.message = Some(error);
            }
        }
        let finished = record.clone();
        evict_finished(&mut records, self.retained);
        Some(finished)
    }

    async fn finish(&self, id: &str, outcome: Result<String, String>) {
        let Some(record) = self.mark_finished(id, outcome) else {
            return;
        };
        self.persist(&record).await;
        match record.status {
            JobStatus::Succeeded => tracing::info!(job_id = %id, kind = %record.kind, "job succeeded"),
            _ => tracing::warn!(
                job_id = %id,
                kind = %record.kind,
                error = record.message.as_deref().unwrap_or_default(),
                "job failed"
            ),
        }
    }

    async fn persist(&self, record: &JobRecord) {
        if let Err(err) = job_store::update_job(&self.pool, record).await {
            tracing::error!(job_id = %record.id, error = ?err, "failed to persist job status");
        }
    }
}

/// Drops the oldest finished records once more than `retained` are held.
/// Queued and running records are never evicted.
fn evict_finished(records: &mut HashMap<String, JobRecord>, retained: usize) {
    let mut finished: Vec<(chrono::DateTime<Utc>, String)> = records
        .values()
        .filter(|record| record.status.is_terminal())
        .map(|record| (record.ended.unwrap_or(record.created_at), record.id.clone()))
        .collect();
    if finished.len() <= retained {
        return;
    }
    finished.sort();
    let excess = finished.len() - retained;
    for (_, id) in finished.into_iter().take(excess) {
        records.remove(&id);
    }
}
