//! ResearchDesk offline ingestion
//!
//! Ingests every supported file under a directory into the knowledge store
//! snapshot, on behalf of one user:
//!
//! ```text
//! ingest ./papers --user 6a1f0c3e-0d7b-4c43-9a43-0f3c1f1f8a10
//! ```

use anyhow::Context;
use clap::Parser;
use researchdesk_common::{
    config::AppConfig, embeddings::create_embedder, llm::create_chat_model, telemetry, QuotaTracker,
    VERSION,
};
use researchdesk_ingestion::extract::is_supported;
use researchdesk_ingestion::{IngestionPipeline, IngestionTask};
use researchdesk_search::store::{KnowledgeStore, StoreConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "ingest", version, about = "Ingest a directory of documents into the ResearchDesk store")]
struct Cli {
    /// Directory to scan recursively
    dir: PathBuf,

    /// Owner of the ingested documents
    #[arg(long)]
    user: Uuid,

    /// Config file (defaults to config/default plus APP_ENV overlays)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path),
        None => AppConfig::load(),
    }
    .context("Failed to load configuration")?;

    telemetry::init_tracing(&config.observability);
    info!("Starting ResearchDesk ingest v{}", VERSION);

    let embedder = create_embedder(&config.embedding)?;
    let vision = create_chat_model(&config.llm)?;
    let store = Arc::new(KnowledgeStore::new(StoreConfig::from_search_config(
        &config.search,
        embedder.dimension(),
    )));

    let snapshot_path = config.snapshot_path();
    {
        let store = store.clone();
        let path = snapshot_path.clone();
        tokio::task::spawn_blocking(move || store.load_snapshot(&path))
            .await?
            .with_context(|| format!("Failed to load snapshot {}", snapshot_path.display()))?;
    }

    let pipeline = IngestionPipeline::from_config(
        &config,
        embedder,
        vision,
        store.clone(),
        QuotaTracker::from_config(&config.quota),
    )?;

    let files = collect_files(&cli.dir)
        .with_context(|| format!("Failed to read directory {}", cli.dir.display()))?;
    info!(files = files.len(), dir = %cli.dir.display(), "Found supported files");

    let mut ingested = 0usize;
    let mut duplicates = 0usize;
    let mut failed = 0usize;
    let mut new_chunks = 0usize;

    for path in files {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read file");
                failed += 1;
                continue;
            }
        };

        let task = IngestionTask::new(cli.user, filename, None, bytes);
        match pipeline.ingest(task, &|_| {}).await {
            Ok(outcome) if outcome.duplicate => {
                duplicates += 1;
                println!("= {} (already ingested)", path.display());
            }
            Ok(outcome) => {
                ingested += 1;
                new_chunks += outcome.new_chunks;
                println!(
                    "+ {} ({} chunks, {} new, {:.1}s)",
                    path.display(),
                    outcome.total_chunks,
                    outcome.new_chunks,
                    outcome.elapsed.as_secs_f64()
                );
            }
            Err(e) => {
                failed += 1;
                println!("! {}: {}", path.display(), e);
            }
        }
    }

    pipeline.save_snapshot().await;

    let stats = store.stats();
    println!(
        "\n{} ingested, {} duplicates, {} failed, {} new chunks; store holds {} documents and {} chunks",
        ingested, duplicates, failed, new_chunks, stats.documents, stats.chunks
    );

    if failed > 0 && ingested == 0 && duplicates == 0 {
        anyhow::bail!("No files could be ingested");
    }
    Ok(())
}

/// Supported files under `dir`, sorted for a stable ingestion order
fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_supported)
            {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
