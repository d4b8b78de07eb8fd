//! ResearchDesk API Gateway
//!
//! The HTTP entry point for uploads, searches and questions.
//! Handles:
//! - Authentication and per-user rate limiting
//! - Document upload into the background ingestion queue
//! - Retrieval and retrieval-augmented answers under token quotas
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use researchdesk_common::{
    auth::{generate_api_key, hash_api_key, AccountDirectory},
    config::AppConfig,
    embeddings::{create_embedder, Embedder},
    errors::AppError,
    llm::{create_chat_model, ChatModel},
    metrics, telemetry, QuotaTracker, VERSION,
};
use researchdesk_ingestion::{IngestionPipeline, IngestionQueue};
use researchdesk_search::{KnowledgeStore, RagConfig, RagEngine, SearchService, StoreConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::middleware::rate_limit::{self, UserRateLimiter};

/// Room for multipart framing around the largest accepted file
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "gateway", version, about = "ResearchDesk API gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a new API key and the hash to list under `auth.accounts`
    Keygen,
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub accounts: Arc<AccountDirectory>,
    pub store: Arc<KnowledgeStore>,
    pub search: Arc<SearchService>,
    pub rag: Arc<RagEngine>,
    pub pipeline: Arc<IngestionPipeline>,
    pub queue: Arc<IngestionQueue>,
    pub quota: QuotaTracker,
    pub rate_limiter: Option<Arc<UserRateLimiter>>,
}

impl FromRef<AppState> for Arc<AccountDirectory> {
    fn from_ref(state: &AppState) -> Self {
        state.accounts.clone()
    }
}

impl AppState {
    /// Wire every service around an already loaded store; starts the ingestion workers
    pub fn new(
        config: AppConfig,
        store: Arc<KnowledgeStore>,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
    ) -> Result<Self, AppError> {
        let quota = QuotaTracker::from_config(&config.quota);
        let accounts = Arc::new(AccountDirectory::from_config(&config.auth, config.quota.default_plan));
        if accounts.is_empty() && !accounts.allows_anonymous() {
            warn!("No API keys configured and anonymous access is off; every API request will be rejected");
        } else {
            info!(accounts = accounts.len(), anonymous = accounts.allows_anonymous(), "Accounts loaded");
        }

        let pipeline = Arc::new(IngestionPipeline::from_config(
            &config,
            embedder.clone(),
            chat.clone(),
            store.clone(),
            quota.clone(),
        )?);
        let queue = Arc::new(IngestionQueue::start(
            pipeline.clone(),
            config.ingestion.queue_capacity,
            config.ingestion.workers,
        ));

        let rag = Arc::new(RagEngine::new(
            store.clone(),
            embedder.clone(),
            chat,
            RagConfig::new(&config.search, &config.llm),
        ));

        Ok(Self {
            search: Arc::new(SearchService::new(store.clone(), embedder)),
            rate_limiter: rate_limit::from_config(&config.rate_limit),
            config: Arc::new(config),
            accounts,
            store,
            rag,
            pipeline,
            queue,
            quota,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Some(Command::Keygen) = Cli::parse().command {
        let key = generate_api_key();
        println!("api_key      = {}", key);
        println!("api_key_hash = {}", hash_api_key(&key));
        return Ok(());
    }

    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    telemetry::init_tracing(&config.observability);
    info!("Starting ResearchDesk API Gateway v{}", VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let mut builder = PrometheusBuilder::new().set_buckets(metrics::LATENCY_BUCKETS)?;
        for name in metrics::slow_histograms() {
            builder = builder.set_buckets_for_metric(Matcher::Full(name), metrics::EMBEDDING_BUCKETS)?;
        }
        builder
            .with_http_listener(([0, 0, 0, 0], config.observability.metrics_port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!(port = config.observability.metrics_port, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    let embedder = create_embedder(&config.embedding)?;
    let chat = create_chat_model(&config.llm)?;
    info!(model = chat.model_name(), dimension = embedder.dimension(), "Model clients ready");

    // Restore the knowledge store
    let store = Arc::new(KnowledgeStore::new(StoreConfig::from_search_config(
        &config.search,
        embedder.dimension(),
    )));
    let snapshot_path = config.snapshot_path();
    if let Some(dir) = snapshot_path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
    }
    {
        let store = store.clone();
        let path = snapshot_path.clone();
        tokio::task::spawn_blocking(move || store.load_snapshot(&path))
            .await?
            .with_context(|| format!("Failed to load snapshot {}", snapshot_path.display()))?;
    }
    let stats = store.stats();
    info!(documents = stats.documents, chunks = stats.chunks, "Knowledge store loaded");

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let snapshot_interval = config.storage.snapshot_interval_secs;
    let shutdown_timeout = config.shutdown_timeout();

    // Create app state
    let state = AppState::new(config, store, embedder, chat)?;
    let background = spawn_maintenance(&state, snapshot_interval);

    // Build the router
    let app = create_router(state.clone());

    info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    background.abort();

    info!("Draining ingestion queue");
    if tokio::time::timeout(shutdown_timeout, state.queue.shutdown())
        .await
        .is_err()
    {
        warn!(
            pending = state.queue.depth(),
            "Ingestion queue did not drain before the shutdown timeout"
        );
    }
    state.pipeline.save_snapshot().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Periodic store snapshots and rate limiter cleanup
fn spawn_maintenance(state: &AppState, snapshot_interval_secs: u64) -> tokio::task::JoinHandle<()> {
    let pipeline = state.pipeline.clone();
    let limiter = state.rate_limiter.clone();
    let queue = state.queue.clone();
    let job_retention = state.config.job_retention();

    tokio::spawn(async move {
        let period = Duration::from_secs(if snapshot_interval_secs == 0 { 60 } else { snapshot_interval_secs });
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if snapshot_interval_secs > 0 {
                pipeline.save_snapshot().await;
            }
            if let Some(limiter) = &limiter {
                limiter.retain_recent();
            }
            queue.evict_finished(job_retention);
        }
    })
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let body_limit = state.config.server.max_upload_bytes + MULTIPART_OVERHEAD_BYTES;
    let timeout = state.config.request_timeout();

    // Health endpoints (no auth, no rate limit)
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready));

    let api_routes = Router::new()
        // Document endpoints
        .route(
            "/documents",
            post(handlers::documents::upload_document).get(handlers::documents::list_documents),
        )
        .route(
            "/documents/{id}",
            get(handlers::documents::get_document).delete(handlers::documents::delete_document),
        )
        // Job endpoints
        .route("/jobs", get(handlers::jobs::list_jobs))
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        // Retrieval and answers
        .route("/search", post(handlers::search::search))
        .route("/query", post(handlers::query::query))
        // Quota
        .route("/usage", get(handlers::usage::get_usage))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_middleware,
        ));

    // Compose the app
    Router::new()
        .nest("/v1", public_routes.merge(api_routes))
        .layer(axum::middleware::from_fn(middleware::metrics::track_metrics))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
