//! Token usage handler

use axum::{extract::State, Json};
use chrono::Utc;

use crate::AppState;
use researchdesk_common::{auth::AuthContext, quota::UsageSnapshot};

/// The caller's daily and monthly token usage against their plan
pub async fn get_usage(State(state): State<AppState>, auth: AuthContext) -> Json<UsageSnapshot> {
    Json(state.quota.snapshot(auth.user_id, auth.plan, Utc::now()))
}
