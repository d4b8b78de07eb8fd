//! Job status handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use researchdesk_common::{auth::AuthContext, errors::Result};
use researchdesk_ingestion::{JobProgress, JobStatus};

/// Job status response
#[derive(Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    pub chunks_total: usize,
    pub chunks_new: usize,
    pub chunks_embedded: usize,
    pub progress_percent: f64,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn progress_percent(job: &JobProgress) -> f64 {
    match job.status {
        JobStatus::Queued => 0.0,
        JobStatus::Extracting => 10.0,
        JobStatus::Chunking => 20.0,
        JobStatus::Embedding if job.new_chunks > 0 => {
            20.0 + 70.0 * job.embedded_chunks.min(job.new_chunks) as f64 / job.new_chunks as f64
        }
        JobStatus::Embedding => 20.0,
        JobStatus::Indexing => 90.0,
        JobStatus::Completed | JobStatus::Failed => 100.0,
    }
}

impl From<JobProgress> for JobResponse {
    fn from(job: JobProgress) -> Self {
        Self {
            progress_percent: progress_percent(&job),
            job_id: job.id,
            filename: job.filename,
            status: job.status,
            document_id: job.document_id,
            chunks_total: job.total_chunks,
            chunks_new: job.new_chunks,
            chunks_embedded: job.embedded_chunks,
            duplicate: job.duplicate,
            error_message: job.error,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

/// Get job status
pub async fn get_job(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let job = state.queue.job_for_owner(job_id, auth.user_id)?;
    Ok(Json(job.into()))
}

/// The caller's jobs, newest first
pub async fn list_jobs(State(state): State<AppState>, auth: AuthContext) -> Json<Vec<JobResponse>> {
    Json(
        state
            .queue
            .jobs_for(auth.user_id)
            .into_iter()
            .map(JobResponse::from)
            .collect(),
    )
}
