//! Configuration management for ResearchDesk services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::quota::Plan;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Knowledge store persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Chat / vision model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Extraction, chunking and queue settings
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Retrieval and index tuning
    #[serde(default)]
    pub search: SearchConfig,

    /// Token quotas per plan
    #[serde(default)]
    pub quota: QuotaConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Largest accepted upload in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding the store snapshot
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Snapshot file name inside `data_dir`
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: String,

    /// Periodic snapshot interval in seconds (0 disables the background task)
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, local
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Texts per embedding request during ingestion
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between ingestion batches in milliseconds
    #[serde(default = "default_batch_pause")]
    pub batch_pause_ms: u64,

    /// Embedding calls allowed in flight across the process
    #[serde(default = "default_embedding_concurrency")]
    pub max_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Chat provider: openai, local
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    pub api_key: Option<String>,

    pub api_base: Option<String>,

    /// Model used for answers
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Model used to describe uploaded images
    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,

    /// Output token cap per answer
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestionConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Overlap for the sliding strategy
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunks shorter than this are merged into a neighbour
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// paragraph, semantic or sliding
    #[serde(default = "default_chunk_strategy")]
    pub strategy: String,

    /// Pick the chunk size from the document length
    #[serde(default = "default_enabled")]
    pub adaptive_chunk_size: bool,

    /// Pending jobs accepted before uploads are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Worker tasks draining the queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds a finished job stays visible before it is forgotten
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// HNSW links per node
    #[serde(default = "default_hnsw_m")]
    pub hnsw_m: usize,

    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,

    #[serde(default = "default_ef_search")]
    pub ef_search: usize,

    /// Below this many vectors the store answers with exact search
    #[serde(default = "default_exact_threshold")]
    pub exact_search_threshold: usize,

    /// Token budget for the context block sent to the model
    #[serde(default = "default_context_tokens")]
    pub context_token_budget: usize,

    /// Maximum context windows sent to the model
    #[serde(default = "default_context_windows")]
    pub max_context_windows: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanLimits {
    /// Tokens per UTC day (0 = unlimited)
    pub daily_tokens: u64,
    /// Tokens per UTC calendar month (0 = unlimited)
    pub monthly_tokens: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Plan used for anonymous callers
    #[serde(default)]
    pub default_plan: Plan,

    /// Charge embedding tokens spent during ingestion
    #[serde(default = "default_enabled")]
    pub count_embedding_tokens: bool,

    #[serde(default = "default_free_limits")]
    pub free: PlanLimits,

    #[serde(default = "default_basic_limits")]
    pub basic: PlanLimits,

    #[serde(default = "default_pro_limits")]
    pub pro: PlanLimits,

    #[serde(default = "default_enterprise_limits")]
    pub enterprise: PlanLimits,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountEntry {
    /// SHA-256 hex of the API key
    pub api_key_hash: String,
    pub user_id: uuid::Uuid,
    #[serde(default)]
    pub plan: Plan,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Known API keys
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,

    /// Accept requests without a key, identified by the user header
    #[serde(default)]
    pub allow_anonymous: bool,

    /// User ID header name for anonymous access
    #[serde(default = "default_user_header")]
    pub user_header: String,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (per user)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 120 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_upload_bytes() -> usize { 25 * 1024 * 1024 }
fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_snapshot_file() -> String { "knowledge.json".to_string() }
fn default_snapshot_interval() -> u64 { 300 }
fn default_embedding_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_batch_size() -> usize { 20 }
fn default_batch_pause() -> u64 { 500 }
fn default_embedding_concurrency() -> usize { 4 }
fn default_llm_provider() -> String { "openai".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_vision_model() -> String { "gpt-4o".to_string() }
fn default_llm_timeout() -> u64 { 60 }
fn default_max_output_tokens() -> u32 { 1000 }
fn default_temperature() -> f32 { 0.3 }
fn default_chunk_size() -> usize { 1000 }
fn default_chunk_overlap() -> usize { 200 }
fn default_min_chunk_size() -> usize { 100 }
fn default_chunk_strategy() -> String { "paragraph".to_string() }
fn default_queue_capacity() -> usize { 64 }
fn default_workers() -> usize { 2 }
fn default_job_retention_secs() -> u64 { 3600 }
fn default_search_limit() -> usize { 8 }
fn default_min_score() -> f32 { 0.2 }
fn default_hnsw_m() -> usize { 16 }
fn default_ef_construction() -> usize { 200 }
fn default_ef_search() -> usize { 64 }
fn default_exact_threshold() -> usize { 2000 }
fn default_context_tokens() -> usize { 3000 }
fn default_context_windows() -> usize { 6 }
fn default_free_limits() -> PlanLimits { PlanLimits { daily_tokens: 20_000, monthly_tokens: 200_000 } }
fn default_basic_limits() -> PlanLimits { PlanLimits { daily_tokens: 100_000, monthly_tokens: 1_500_000 } }
fn default_pro_limits() -> PlanLimits { PlanLimits { daily_tokens: 500_000, monthly_tokens: 10_000_000 } }
fn default_enterprise_limits() -> PlanLimits { PlanLimits { daily_tokens: 0, monthly_tokens: 0 } }
fn default_user_header() -> String { "X-User-ID".to_string() }
fn default_request_id_header() -> String { "X-Request-ID".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "researchdesk".to_string() }
fn default_rate_limit() -> u32 { 10 }
fn default_burst() -> u32 { 30 }
fn default_enabled() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__SERVER__PORT=8081
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific config file, still honouring APP__ overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// How long finished ingestion jobs are kept
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.ingestion.job_retention_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Full path of the knowledge store snapshot
    pub fn snapshot_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.snapshot_file)
    }
}

impl QuotaConfig {
    /// Limits configured for a plan
    pub fn limits_for(&self, plan: Plan) -> &PlanLimits {
        match plan {
            Plan::Free => &self.free,
            Plan::Basic => &self.basic,
            Plan::Pro => &self.pro,
            Plan::Enterprise => &self.enterprise,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            snapshot_file: default_snapshot_file(),
            snapshot_interval_secs: default_snapshot_interval(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause(),
            max_concurrency: default_embedding_concurrency(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_key: None,
            api_base: None,
            model: default_llm_model(),
            vision_model: default_vision_model(),
            timeout_secs: default_llm_timeout(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            min_chunk_size: default_min_chunk_size(),
            strategy: default_chunk_strategy(),
            adaptive_chunk_size: default_enabled(),
            queue_capacity: default_queue_capacity(),
            workers: default_workers(),
            job_retention_secs: default_job_retention_secs(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_search_limit(),
            min_score: default_min_score(),
            hnsw_m: default_hnsw_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            exact_search_threshold: default_exact_threshold(),
            context_token_budget: default_context_tokens(),
            max_context_windows: default_context_windows(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            default_plan: Plan::default(),
            count_embedding_tokens: default_enabled(),
            free: default_free_limits(),
            basic: default_basic_limits(),
            pro: default_pro_limits(),
            enterprise: default_enterprise_limits(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            allow_anonymous: false,
            user_header: default_user_header(),
            request_id_header: default_request_id_header(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            ingestion: IngestionConfig::default(),
            search: SearchConfig::default(),
            quota: QuotaConfig::default(),
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.ingestion.strategy, "paragraph");
    }

    #[test]
    fn test_snapshot_path() {
        let config = AppConfig::default();
        assert_eq!(config.snapshot_path(), PathBuf::from("data/knowledge.json"));
    }

    #[test]
    fn test_plan_limits_lookup() {
        let quota = QuotaConfig::default();
        assert_eq!(quota.limits_for(Plan::Free).daily_tokens, 20_000);
        assert_eq!(quota.limits_for(Plan::Enterprise).monthly_tokens, 0);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(config::File::from_str(
                "[server]\nport = 9001\n[embedding]\nprovider = \"local\"\ndimension = 64\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.embedding.dimension, 64);
        assert_eq!(config.search.hnsw_m, 16);
    }
}
