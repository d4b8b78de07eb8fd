//! Background ingestion queue
//!
//! Uploads are accepted immediately and processed by a fixed pool of workers
//! reading from a bounded channel. Job progress lives in an in-memory registry
//! until a finished job outlives the retention window.

use crate::pipeline::{IngestionOutcome, IngestionPipeline, IngestionTask, Progress, Stage};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use researchdesk_common::errors::AppError;
use researchdesk_common::metrics;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Job lifecycle; a job only ever moves forward through these states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Extracting,
    Chunking,
    Embedding,
    Indexing,
    Completed,
    Failed,
}

impl JobStatus {
    fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Extracting => 1,
            JobStatus::Chunking => 2,
            JobStatus::Embedding => 3,
            JobStatus::Indexing => 4,
            JobStatus::Completed | JobStatus::Failed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<Stage> for JobStatus {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Extracting => JobStatus::Extracting,
            Stage::Chunking => JobStatus::Chunking,
            Stage::Embedding => JobStatus::Embedding,
            Stage::Indexing => JobStatus::Indexing,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    pub document_id: Option<Uuid>,
    pub total_chunks: usize,
    pub new_chunks: usize,
    pub embedded_chunks: usize,
    pub duplicate: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    fn queued(task: &IngestionTask) -> Self {
        let now = Utc::now();
        Self {
            id: task.job_id,
            owner_id: task.owner_id,
            filename: task.filename.clone(),
            status: JobStatus::Queued,
            document_id: None,
            total_chunks: 0,
            new_chunks: 0,
            embedded_chunks: 0,
            duplicate: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Job id -> progress
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, JobProgress>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, job: JobProgress) {
        self.jobs.write().insert(job.id, job);
    }

    pub fn get(&self, id: Uuid) -> Option<JobProgress> {
        self.jobs.read().get(&id).cloned()
    }

    /// Newest first
    pub fn for_owner(&self, owner_id: Uuid) -> Vec<JobProgress> {
        let mut jobs: Vec<JobProgress> = self
            .jobs
            .read()
            .values()
            .filter(|j| j.owner_id == owner_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Apply `f` to a job that has not finished yet
    fn update(&self, id: Uuid, f: impl FnOnce(&mut JobProgress)) {
        if let Some(job) = self.jobs.write().get_mut(&id) {
            if !job.status.is_terminal() {
                f(job);
                job.updated_at = Utc::now();
            }
        }
    }

    /// Move to `status` unless the job is already at or past it
    pub fn advance(&self, id: Uuid, status: JobStatus) {
        self.update(id, |job| {
            if status.rank() > job.status.rank() {
                job.status = status;
            }
        });
    }

    fn record_progress(&self, id: Uuid, progress: Progress) {
        match progress {
            Progress::Stage(stage) => self.advance(id, stage.into()),
            Progress::Chunked { total, to_embed } => self.update(id, |job| {
                job.total_chunks = total;
                job.new_chunks = to_embed;
            }),
            Progress::Embedded { done, .. } => self.update(id, |job| job.embedded_chunks = done),
        }
    }

    fn complete(&self, id: Uuid, outcome: &IngestionOutcome) {
        self.update(id, |job| {
            job.status = JobStatus::Completed;
            job.document_id = Some(outcome.document.id);
            job.total_chunks = outcome.total_chunks;
            job.new_chunks = outcome.new_chunks;
            job.embedded_chunks = outcome.new_chunks;
            job.duplicate = outcome.duplicate;
        });
    }

    fn fail(&self, id: Uuid, message: String) {
        self.update(id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(message);
        });
    }

    /// Drop finished jobs last updated before `cutoff`; returns how many went
    pub fn evict_finished(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, job| !job.status.is_terminal() || job.updated_at >= cutoff);
        before - jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }
}

/// Bounded queue of ingestion tasks served by a worker pool
pub struct IngestionQueue {
    sender: RwLock<Option<mpsc::Sender<IngestionTask>>>,
    registry: JobRegistry,
    pending: Arc<AtomicUsize>,
    capacity: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IngestionQueue {
    /// Spawn `workers` tasks consuming a channel of `capacity` slots
    pub fn start(pipeline: Arc<IngestionPipeline>, capacity: usize, workers: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<IngestionTask>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let registry = JobRegistry::new();
        let pending = Arc::new(AtomicUsize::new(0));

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    pipeline.clone(),
                    receiver.clone(),
                    registry.clone(),
                    pending.clone(),
                ))
            })
            .collect();

        info!(capacity, workers = workers.max(1), "Ingestion queue started");

        Self {
            sender: RwLock::new(Some(sender)),
            registry,
            pending,
            capacity,
            workers: Mutex::new(handles),
        }
    }

    /// Register the job and hand it to the workers without waiting
    pub fn submit(&self, task: IngestionTask) -> Result<JobProgress, AppError> {
        let job = JobProgress::queued(&task);
        let job_id = job.id;
        self.registry.insert(job.clone());

        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            self.registry.fail(job_id, "ingestion queue is shut down".to_string());
            return Err(AppError::ServiceUnavailable {
                message: "Ingestion queue is shut down".to_string(),
            });
        };

        // Counted before sending so a worker never decrements first
        let depth = self.pending.fetch_add(1, Ordering::SeqCst) + 1;
        let sent = sender.try_send(task);
        if sent.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }

        match sent {
            Ok(()) => {
                metrics::set_queue_depth(depth);
                info!(job_id = %job_id, depth, "Ingestion job queued");
                Ok(job)
            }
            Err(TrySendError::Full(_)) => {
                warn!(job_id = %job_id, capacity = self.capacity, "Ingestion queue full");
                self.registry.fail(job_id, "ingestion queue is full".to_string());
                metrics::record_job("rejected");
                Err(AppError::QueueFull { capacity: self.capacity })
            }
            Err(TrySendError::Closed(_)) => {
                self.registry.fail(job_id, "ingestion queue is shut down".to_string());
                Err(AppError::ServiceUnavailable {
                    message: "Ingestion queue is shut down".to_string(),
                })
            }
        }
    }

    pub fn job(&self, id: Uuid) -> Option<JobProgress> {
        self.registry.get(id)
    }

    /// A job as seen by `owner_id`; other owners' jobs are reported as missing
    pub fn job_for_owner(&self, id: Uuid, owner_id: Uuid) -> Result<JobProgress, AppError> {
        self.registry
            .get(id)
            .filter(|job| job.owner_id == owner_id)
            .ok_or_else(|| AppError::JobNotFound { id: id.to_string() })
    }

    pub fn jobs_for(&self, owner_id: Uuid) -> Vec<JobProgress> {
        self.registry.for_owner(owner_id)
    }

    /// Forget jobs that finished more than `retention` ago
    pub fn evict_finished(&self, retention: std::time::Duration) -> usize {
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        let Some(cutoff) = cutoff else {
            return 0;
        };
        let evicted = self.registry.evict_finished(cutoff);
        if evicted > 0 {
            info!(evicted, remaining = self.registry.len(), "Evicted finished ingestion jobs");
        }
        evicted
    }

    /// Tasks waiting for a worker
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_accepting(&self) -> bool {
        self.sender.read().as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Stop accepting jobs and wait for the workers to drain the channel
    pub async fn shutdown(&self) {
        drop(self.sender.write().take());
        let handles = std::mem::take(&mut *self.workers.lock());
        info!(workers = handles.len(), pending = self.depth(), "Draining ingestion queue");
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Ingestion worker ended abnormally");
            }
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    pipeline: Arc<IngestionPipeline>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<IngestionTask>>>,
    registry: JobRegistry,
    pending: Arc<AtomicUsize>,
) {
    loop {
        // Hold the lock only while waiting, never while processing
        let task = receiver.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        let depth = pending.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::set_queue_depth(depth);

        let job_id = task.job_id;
        let filename = task.filename.clone();
        let progress_registry = registry.clone();
        let result = pipeline
            .ingest(task, &move |p| progress_registry.record_progress(job_id, p))
            .await;

        match result {
            Ok(outcome) => {
                info!(
                    worker_id,
                    job_id = %job_id,
                    document_id = %outcome.document.id,
                    duplicate = outcome.duplicate,
                    "Ingestion job completed"
                );
                registry.complete(job_id, &outcome);
                metrics::record_job(if outcome.duplicate { "duplicate" } else { "completed" });
            }
            Err(e) => {
                warn!(worker_id, job_id = %job_id, filename = %filename, error = %e, "Ingestion job failed");
                let e = AppError::from(e);
                registry.fail(job_id, e.to_string());
                metrics::record_job("failed");
            }
        }
    }
    info!(worker_id, "Ingestion worker stopped");
}
