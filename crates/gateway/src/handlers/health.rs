//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub store: StoreCheck,
    pub ingestion_queue: QueueCheck,
}

#[derive(Serialize)]
pub struct StoreCheck {
    pub status: String,
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub index: &'static str,
}

#[derive(Serialize)]
pub struct QueueCheck {
    pub status: String,
    pub depth: usize,
    pub capacity: usize,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: researchdesk_common::VERSION.to_string(),
    })
}

/// Readiness probe - store contents and whether uploads are accepted
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let stats = state.store.stats();
    let accepting = state.queue.is_accepting();

    let status = if accepting { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(ReadyResponse {
            status: if accepting { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks {
                store: StoreCheck {
                    status: "up".to_string(),
                    documents: stats.documents,
                    chunks: stats.chunks,
                    vectors: stats.vectors,
                    index: stats.index_kind,
                },
                ingestion_queue: QueueCheck {
                    status: if accepting { "up" } else { "down" }.to_string(),
                    depth: state.queue.depth(),
                    capacity: state.queue.capacity(),
                },
            },
        }),
    )
}
