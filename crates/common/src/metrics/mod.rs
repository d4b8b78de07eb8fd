//! Metrics and observability utilities
//!
//! Prometheus metrics with SLO-aligned histograms and a shared
//! naming prefix. Recording is a no-op until a recorder is installed.

use crate::tokens::TokenUsage;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all ResearchDesk metrics
pub const METRICS_PREFIX: &str = "researchdesk";

/// SLO-aligned histogram buckets for request latency (in seconds)
/// Targets: P50 < 50ms, P99 < 150ms for search
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, // 1ms
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms - P50 target
    0.075, // 75ms
    0.100, // 100ms
    0.150, // 150ms - P99 target
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
];

/// Buckets for embedding, LLM and ingestion latency (typically slower)
pub const EMBEDDING_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Histograms recorded with [`EMBEDDING_BUCKETS`] instead of [`LATENCY_BUCKETS`]
pub fn slow_histograms() -> [String; 3] {
    [
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
    ]
}

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );
    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of search queries"
    );
    describe_histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Search query latency in seconds"
    );
    describe_gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        Unit::Count,
        "Number of results returned from the last search"
    );

    describe_counter!(
        format!("{}_documents_ingested_total", METRICS_PREFIX),
        Unit::Count,
        "Total documents ingested"
    );
    describe_counter!(
        format!("{}_chunks_created_total", METRICS_PREFIX),
        Unit::Count,
        "Total new chunks embedded and indexed"
    );
    describe_counter!(
        format!("{}_chunks_reused_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks skipped because identical text was already indexed"
    );
    describe_histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Document ingestion latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );
    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );
    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API errors"
    );

    describe_counter!(
        format!("{}_llm_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total chat model requests"
    );
    describe_histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Chat model latency in seconds"
    );
    describe_counter!(
        format!("{}_llm_tokens_total", METRICS_PREFIX),
        Unit::Count,
        "Tokens consumed by chat model calls"
    );

    describe_counter!(
        format!("{}_quota_rejections_total", METRICS_PREFIX),
        Unit::Count,
        "Requests rejected because a usage quota was exhausted"
    );

    describe_gauge!(
        format!("{}_queue_depth", METRICS_PREFIX),
        Unit::Count,
        "Ingestion jobs waiting for a worker"
    );
    describe_counter!(
        format!("{}_jobs_finished_total", METRICS_PREFIX),
        Unit::Count,
        "Ingestion jobs finished, by outcome"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Helper to record search metrics
pub fn record_search(duration_secs: f64, mode: &str, result_count: usize) {
    counter!(
        format!("{}_search_queries_total", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_search_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_search_results_count", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .set(result_count as f64);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, batch_size: usize, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
        tracing::trace!(model, batch_size, duration_secs, "Embedding batch completed");
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Helper to record chat model metrics; `usage` is `None` on failure
pub fn record_llm(duration_secs: f64, model: &str, usage: Option<&TokenUsage>) {
    let status = if usage.is_some() { "success" } else { "error" };

    counter!(
        format!("{}_llm_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status
    )
    .increment(1);

    histogram!(
        format!("{}_llm_duration_seconds", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .record(duration_secs);

    if let Some(usage) = usage {
        counter!(
            format!("{}_llm_tokens_total", METRICS_PREFIX),
            "model" => model.to_string(),
            "kind" => "prompt"
        )
        .increment(usage.prompt_tokens);
        counter!(
            format!("{}_llm_tokens_total", METRICS_PREFIX),
            "model" => model.to_string(),
            "kind" => "completion"
        )
        .increment(usage.completion_tokens);
    }
}

/// Helper to record ingestion metrics
pub fn record_ingestion(duration_secs: f64, new_chunks: usize, reused_chunks: usize, file_type: &str) {
    counter!(
        format!("{}_documents_ingested_total", METRICS_PREFIX),
        "file_type" => file_type.to_string()
    )
    .increment(1);

    counter!(format!("{}_chunks_created_total", METRICS_PREFIX)).increment(new_chunks as u64);
    counter!(format!("{}_chunks_reused_total", METRICS_PREFIX)).increment(reused_chunks as u64);

    histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        "file_type" => file_type.to_string()
    )
    .record(duration_secs);
}

/// Helper to record a quota rejection
pub fn record_quota_rejection(plan: &str) {
    counter!(
        format!("{}_quota_rejections_total", METRICS_PREFIX),
        "plan" => plan.to_string()
    )
    .increment(1);
}

/// Helper to publish the ingestion queue depth
pub fn set_queue_depth(depth: usize) {
    gauge!(format!("{}_queue_depth", METRICS_PREFIX)).set(depth as f64);
}

/// Helper to record a finished ingestion job
pub fn record_job(outcome: &str) {
    counter!(
        format!("{}_jobs_finished_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_buckets() {
        let mut prev = 0.0;
        for &bucket in LATENCY_BUCKETS {
            assert!(bucket > prev);
            prev = bucket;
        }

        assert!(LATENCY_BUCKETS.contains(&0.050));
        assert!(LATENCY_BUCKETS.contains(&0.150));
    }

    #[test]
    fn test_slow_histograms_use_wider_buckets() {
        assert!(EMBEDDING_BUCKETS.windows(2).all(|w| w[0] < w[1]));
        assert!(EMBEDDING_BUCKETS.last() > LATENCY_BUCKETS.last());
        assert!(slow_histograms().iter().all(|n| n.starts_with("researchdesk_") && n.ends_with("_seconds")));
    }

    #[test]
    fn test_recording_without_recorder() {
        let metrics = RequestMetrics::start("POST", "/v1/search");
        metrics.finish(200);
        record_search(0.01, "hybrid", 3);
        record_llm(0.2, "local-extractive", Some(&TokenUsage::new(10, 5)));
        record_llm(0.2, "local-extractive", None);
        record_quota_rejection("free");
        set_queue_depth(2);
        record_job("completed");
    }
}
