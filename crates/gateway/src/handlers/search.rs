//! Search handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use researchdesk_common::{
    auth::AuthContext,
    errors::{AppError, Result},
};
use researchdesk_search::{RetrievalMode, SearchRequest as StoreSearchRequest};

/// Search request
#[derive(Debug, Deserialize, Validate)]
pub struct SearchRequest {
    #[validate(length(min = 1, max = 1000))]
    pub query: String,

    /// vector, keyword or hybrid (default)
    #[serde(default)]
    pub mode: RetrievalMode,

    /// Maximum results to return
    #[validate(range(min = 1, max = 100))]
    pub limit: Option<usize>,

    /// Minimum score threshold
    #[validate(range(min = 0.0, max = 1.0))]
    pub min_score: Option<f32>,

    /// Restrict to these documents
    pub document_ids: Option<Vec<Uuid>>,
}

/// Search response
#[derive(Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub mode: RetrievalMode,
    pub total_results: usize,
    pub results: Vec<SearchResultItem>,
    pub processing_time_ms: u64,
}

#[derive(Serialize)]
pub struct SearchResultItem {
    pub chunk_id: String,
    pub document_id: Uuid,
    pub filename: String,
    pub content: String,
    pub chunk_index: u32,
    pub page: u32,
    pub score: f32,
}

/// Retrieve matching chunks from the caller's documents
pub async fn search(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let response = state
        .search
        .search(&StoreSearchRequest {
            owner_id: auth.user_id,
            query: request.query.clone(),
            mode: request.mode,
            limit: request.limit.unwrap_or(state.config.search.default_limit),
            min_score: Some(request.min_score.unwrap_or(state.config.search.min_score)),
            document_ids: request.document_ids,
        })
        .await?;

    tracing::info!(
        mode = request.mode.as_str(),
        results = response.chunks.len(),
        latency_ms = response.query_time_ms,
        user_id = %auth.user_id,
        "Search completed"
    );

    Ok(Json(SearchResponse {
        query: request.query,
        mode: response.mode,
        total_results: response.chunks.len(),
        results: response
            .chunks
            .into_iter()
            .map(|c| SearchResultItem {
                chunk_id: c.chunk_id.to_string(),
                document_id: c.document_id,
                filename: c.filename,
                content: c.content,
                chunk_index: c.chunk_index,
                page: c.page,
                score: c.score,
            })
            .collect(),
        processing_time_ms: response.query_time_ms,
    }))
}
