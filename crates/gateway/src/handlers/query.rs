//! Question answering over the caller's documents

use axum::{extract::State, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

use crate::AppState;
use researchdesk_common::{
    auth::AuthContext,
    errors::{AppError, Result},
    tokens::TokenUsage,
};
use researchdesk_search::{Citation, QueryOptions, Source, MAX_SEARCH_LIMIT};

/// Query request
#[derive(Debug, Deserialize, Validate)]
pub struct QueryRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,

    #[serde(flatten)]
    pub options: QueryOptions,
}

/// Query response
#[derive(Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<Citation>,
    pub sources: Vec<Source>,
    pub usage: TokenUsage,
    pub model: String,
    pub processing_time_ms: u64,
}

fn validate_options(options: &QueryOptions) -> Result<()> {
    if let Some(limit) = options.limit {
        if limit == 0 || limit > MAX_SEARCH_LIMIT {
            return Err(AppError::Validation {
                message: format!("limit must be between 1 and {}", MAX_SEARCH_LIMIT),
                field: Some("limit".to_string()),
            });
        }
    }
    if let Some(min_score) = options.min_score {
        if !(0.0..=1.0).contains(&min_score) {
            return Err(AppError::Validation {
                message: "min_score must be between 0 and 1".to_string(),
                field: Some("min_score".to_string()),
            });
        }
    }
    Ok(())
}

/// Answer a question from retrieved context.
///
/// Tokens for the prompt and the full output allowance are reserved before
/// the model is called; the reservation is settled with the reported usage.
pub async fn query(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>> {
    let start = Instant::now();

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;
    validate_options(&request.options)?;

    // Refuse an exhausted quota before the question is embedded
    drop(state.quota.reserve(auth.user_id, auth.plan, 1, Utc::now())?);

    let prepared = state
        .rag
        .prepare(auth.user_id, &request.question, &request.options)
        .await?;

    let reservation = state.quota.reserve(
        auth.user_id,
        auth.plan,
        prepared.reservation_tokens(),
        Utc::now(),
    )?;
    let reserved = reservation.tokens();

    // A failed call drops the reservation without charging
    let answer = state.rag.answer(prepared).await?;
    reservation.settle(answer.usage.total());

    tracing::info!(
        user_id = %auth.user_id,
        sources = answer.sources.len(),
        citations = answer.citations.len(),
        reserved_tokens = reserved,
        used_tokens = answer.usage.total(),
        "Query answered"
    );

    Ok(Json(QueryResponse {
        answer: answer.answer,
        citations: answer.citations,
        sources: answer.sources,
        usage: answer.usage,
        model: answer.model,
        processing_time_ms: start.elapsed().as_millis() as u64,
    }))
}
