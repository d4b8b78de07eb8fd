//! Document upload and management handlers

use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use researchdesk_common::{
    auth::AuthContext,
    errors::{AppError, Result},
};
use researchdesk_ingestion::{extract::detect_kind, IngestionTask, JobStatus};
use researchdesk_search::DocumentRecord;

/// Multipart field carrying the file
const FILE_FIELD: &str = "file";

/// Response after accepting an upload
#[derive(Serialize)]
pub struct UploadResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub filename: String,
    pub size_bytes: usize,
    pub poll_url: String,
}

#[derive(Serialize)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub filename: String,
    pub kind: String,
    pub size_bytes: u64,
    pub page_count: u32,
    pub chunk_count: usize,
    pub token_count: u64,
    pub created_at: String,
}

impl From<&DocumentRecord> for DocumentSummary {
    fn from(doc: &DocumentRecord) -> Self {
        Self {
            id: doc.id,
            filename: doc.filename.clone(),
            kind: doc.kind.to_string(),
            size_bytes: doc.size_bytes,
            page_count: doc.page_count,
            chunk_count: doc.chunk_ids.len(),
            token_count: doc.token_count,
            created_at: doc.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct DocumentListResponse {
    pub documents: Vec<DocumentSummary>,
    pub total: usize,
}

#[derive(Serialize)]
pub struct DocumentDetail {
    #[serde(flatten)]
    pub summary: DocumentSummary,
    pub content_hash: String,
    pub chunks: Vec<ChunkPreview>,
}

#[derive(Serialize)]
pub struct ChunkPreview {
    pub index: u32,
    pub page: u32,
    pub preview: String,
}

const PREVIEW_CHARS: usize = 160;

fn multipart_error(e: MultipartError, limit: usize) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge { size: limit + 1, limit }
    } else {
        AppError::Validation {
            message: e.body_text(),
            field: Some(FILE_FIELD.to_string()),
        }
    }
}

/// Accept a file and queue it for ingestion
pub async fn upload_document(
    State(state): State<AppState>,
    auth: AuthContext,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>)> {
    let limit = state.config.server.max_upload_bytes;
    let mut upload = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| multipart_error(e, limit))? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .ok_or_else(|| AppError::Validation {
                message: "Uploaded file must have a filename".to_string(),
                field: Some(FILE_FIELD.to_string()),
            })?;
        let content_type = field.content_type().map(String::from);
        let bytes = field.bytes().await.map_err(|e| multipart_error(e, limit))?;

        upload = Some((filename, content_type, bytes));
        break;
    }

    let (filename, content_type, bytes) = upload.ok_or_else(|| AppError::MissingField {
        field: FILE_FIELD.to_string(),
    })?;

    if bytes.is_empty() {
        return Err(AppError::Validation {
            message: format!("Uploaded file {} is empty", filename),
            field: Some(FILE_FIELD.to_string()),
        });
    }
    if bytes.len() > limit {
        return Err(AppError::PayloadTooLarge { size: bytes.len(), limit });
    }

    // Reject unreadable formats before they take a queue slot
    detect_kind(&filename, content_type.as_deref()).map_err(AppError::from)?;

    // Callers without any budget left cannot start new work; the reservation
    // is released immediately
    drop(state.quota.reserve(auth.user_id, auth.plan, 1, Utc::now())?);

    let size_bytes = bytes.len();
    let job = state.queue.submit(IngestionTask::new(
        auth.user_id,
        filename,
        content_type,
        bytes.to_vec(),
    ))?;

    tracing::info!(
        job_id = %job.id,
        user_id = %auth.user_id,
        filename = %job.filename,
        size_bytes,
        "Document upload accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            job_id: job.id,
            status: job.status,
            filename: job.filename,
            size_bytes,
            poll_url: format!("/v1/jobs/{}", job.id),
        }),
    ))
}

/// List the caller's documents, newest first
pub async fn list_documents(State(state): State<AppState>, auth: AuthContext) -> Json<DocumentListResponse> {
    let documents: Vec<DocumentSummary> = state
        .store
        .list_documents(auth.user_id)
        .iter()
        .map(DocumentSummary::from)
        .collect();

    Json(DocumentListResponse {
        total: documents.len(),
        documents,
    })
}

fn owned_document(state: &AppState, auth: &AuthContext, id: Uuid) -> Result<DocumentRecord> {
    let doc = state
        .store
        .get_document(id)
        .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })?;

    if doc.owner_id != auth.user_id {
        return Err(AppError::Forbidden {
            message: "Document belongs to another user".to_string(),
        });
    }
    Ok(doc)
}

/// Get a document with a preview of each chunk
pub async fn get_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentDetail>> {
    let doc = owned_document(&state, &auth, id)?;

    let chunks = state
        .store
        .document_chunks(id)
        .into_iter()
        .map(|(index, page, content)| ChunkPreview {
            index,
            page,
            preview: content.chars().take(PREVIEW_CHARS).collect(),
        })
        .collect();

    Ok(Json(DocumentDetail {
        summary: DocumentSummary::from(&doc),
        content_hash: doc.content_hash,
        chunks,
    }))
}

/// Delete a document and any chunks no other document uses
pub async fn delete_document(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    let removed = state.store.delete_document(auth.user_id, id)?;

    tracing::info!(
        document_id = %id,
        user_id = %auth.user_id,
        filename = %removed.filename,
        "Document deleted"
    );

    let pipeline = state.pipeline.clone();
    tokio::spawn(async move { pipeline.save_snapshot().await });

    Ok(StatusCode::NO_CONTENT)
}
