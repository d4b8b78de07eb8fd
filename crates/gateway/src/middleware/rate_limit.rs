//! Per-user rate limiting using the token bucket algorithm

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use researchdesk_common::config::RateLimitConfig;
use researchdesk_common::errors::AppError;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::AppState;

/// One token bucket per caller key
pub type UserRateLimiter = DefaultKeyedRateLimiter<String>;

/// Create a keyed rate limiter
pub fn create_rate_limiter(requests_per_second: u32, burst: u32) -> Arc<UserRateLimiter> {
    let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    let burst = NonZeroU32::new(burst.max(requests_per_second)).unwrap_or(per_second);
    Arc::new(RateLimiter::keyed(Quota::per_second(per_second).allow_burst(burst)))
}

/// Limiter for the configured settings, `None` when disabled
pub fn from_config(config: &RateLimitConfig) -> Option<Arc<UserRateLimiter>> {
    config
        .enabled
        .then(|| create_rate_limiter(config.requests_per_second, config.burst))
}

/// Rate limiting middleware keyed by the caller's user id
///
/// Callers whose credentials do not resolve share one bucket; the handler
/// rejects them afterwards anyway.
pub async fn rate_limit_middleware(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(limiter) = state.rate_limiter.as_ref() else {
        return next.run(request).await;
    };

    let (parts, body) = request.into_parts();
    let key = state
        .accounts
        .authenticate(&parts)
        .map(|ctx| ctx.user_id.to_string())
        .unwrap_or_else(|_| "unauthenticated".to_string());

    match limiter.check_key(&key) {
        Ok(()) => next.run(Request::from_parts(parts, body)).await,
        Err(_) => {
            tracing::warn!(key = %key, "Rate limit exceeded");
            AppError::RateLimited {
                limit: state.config.rate_limit.requests_per_second,
            }
            .into_response()
        }
    }
}
