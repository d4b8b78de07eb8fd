//! Ingestion pipeline
//!
//! extract -> duplicate check -> chunk -> embed new chunks -> store -> snapshot

use crate::chunker::{chunk_document, ChunkingConfig};
use crate::errors::IngestionError;
use crate::extract::Extractor;
use researchdesk_common::config::AppConfig;
use researchdesk_common::embeddings::Embedder;
use researchdesk_common::errors::AppError;
use researchdesk_common::llm::ChatModel;
use researchdesk_common::quota::QuotaTracker;
use researchdesk_search::model::{ChunkId, DocumentRecord, NewChunk};
use researchdesk_search::store::{AddResult, KnowledgeStore};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Inserts retried after shared chunks vanished during embedding
const MAX_INSERT_ATTEMPTS: usize = 3;

/// Pipeline settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Texts per embedding request
    pub batch_size: usize,
    /// Pause between embedding batches of one document
    pub batch_pause: Duration,
    /// Embedding calls in flight across all documents
    pub max_concurrency: usize,
    /// Charge embedding tokens to the uploader
    pub count_embedding_tokens: bool,
    /// Save the store here after each document
    pub snapshot_path: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            batch_pause: Duration::from_millis(500),
            max_concurrency: 4,
            count_embedding_tokens: true,
            snapshot_path: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.embedding.batch_size.max(1),
            batch_pause: Duration::from_millis(config.embedding.batch_pause_ms),
            max_concurrency: config.embedding.max_concurrency.max(1),
            count_embedding_tokens: config.quota.count_embedding_tokens,
            snapshot_path: Some(config.snapshot_path()),
        }
    }
}

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extracting,
    Chunking,
    Embedding,
    Indexing,
}

/// Progress reported while a document is ingested
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Stage(Stage),
    /// Chunks produced, and how many of them need an embedding
    Chunked { total: usize, to_embed: usize },
    Embedded { done: usize, total: usize },
}

/// A file to ingest on behalf of its owner
#[derive(Debug, Clone)]
pub struct IngestionTask {
    pub job_id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl IngestionTask {
    pub fn new(owner_id: Uuid, filename: impl Into<String>, content_type: Option<String>, bytes: Vec<u8>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            owner_id,
            filename: filename.into(),
            content_type,
            bytes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionOutcome {
    pub document: DocumentRecord,
    /// The owner already had a document with identical content
    pub duplicate: bool,
    pub total_chunks: usize,
    pub new_chunks: usize,
    pub reused_chunks: usize,
    /// Tokens charged to the owner (embeddings and image descriptions)
    pub charged_tokens: u64,
    pub elapsed: Duration,
}

impl IngestionOutcome {
    fn duplicate_of(existing: DocumentRecord, charged_tokens: u64, start: Instant) -> Self {
        info!(document_id = %existing.id, "Identical document already ingested");
        Self {
            total_chunks: existing.chunk_ids.len(),
            document: existing,
            duplicate: true,
            new_chunks: 0,
            reused_chunks: 0,
            charged_tokens,
            elapsed: start.elapsed(),
        }
    }
}

pub struct IngestionPipeline {
    extractor: Extractor,
    embedder: Arc<dyn Embedder>,
    store: Arc<KnowledgeStore>,
    quota: QuotaTracker,
    chunking: ChunkingConfig,
    config: PipelineConfig,
    permits: Arc<Semaphore>,
}

impl IngestionPipeline {
    pub fn new(
        extractor: Extractor,
        embedder: Arc<dyn Embedder>,
        store: Arc<KnowledgeStore>,
        quota: QuotaTracker,
        chunking: ChunkingConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            extractor,
            embedder,
            store,
            quota,
            chunking,
            config,
        }
    }

    /// Pipeline wired from application config; `vision` describes images
    pub fn from_config(
        config: &AppConfig,
        embedder: Arc<dyn Embedder>,
        vision: Arc<dyn ChatModel>,
        store: Arc<KnowledgeStore>,
        quota: QuotaTracker,
    ) -> Result<Self, AppError> {
        Ok(Self::new(
            Extractor::new(vision),
            embedder,
            store,
            quota,
            ChunkingConfig::from_ingestion_config(&config.ingestion)?,
            PipelineConfig::from_app_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<KnowledgeStore> {
        &self.store
    }

    /// Run one file through the whole pipeline
    #[instrument(
        skip(self, task, progress),
        fields(job_id = %task.job_id, owner_id = %task.owner_id, filename = %task.filename)
    )]
    pub async fn ingest(
        &self,
        task: IngestionTask,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<IngestionOutcome, IngestionError> {
        let start = Instant::now();
        let IngestionTask {
            owner_id,
            filename,
            content_type,
            bytes,
            ..
        } = task;

        if bytes.is_empty() {
            return Err(IngestionError::EmptyUpload { filename });
        }
        let size_bytes = bytes.len() as u64;

        progress(Progress::Stage(Stage::Extracting));
        let extracted = self
            .extractor
            .extract(&filename, bytes, content_type.as_deref())
            .await?;

        let mut charged_tokens = extracted.model_usage.total();
        if charged_tokens > 0 {
            self.quota.record(owner_id, charged_tokens, chrono::Utc::now());
        }

        if let Some(existing) = self.store.find_duplicate(owner_id, &extracted.content_hash) {
            return Ok(IngestionOutcome::duplicate_of(existing, charged_tokens, start));
        }

        progress(Progress::Stage(Stage::Chunking));
        let text_chunks = chunk_document(&extracted.pages, &self.chunking);
        if text_chunks.is_empty() {
            return Err(IngestionError::NoText { filename });
        }

        let mut chunks: Vec<NewChunk> = text_chunks
            .into_iter()
            .map(|c| NewChunk::new(c.content, c.index, c.page, c.token_count))
            .collect();

        // Only text the store has never seen needs an embedding
        let to_embed: Vec<(ChunkId, String, u32)> = {
            let mut seen: HashSet<&ChunkId> = HashSet::new();
            chunks
                .iter()
                .filter(|&c| !self.store.chunk_exists(&c.id) && seen.insert(&c.id))
                .map(|c| (c.id.clone(), c.content.clone(), c.token_count))
                .collect()
        };
        progress(Progress::Chunked {
            total: chunks.len(),
            to_embed: to_embed.len(),
        });

        progress(Progress::Stage(Stage::Embedding));
        let embeddings = self.embed_chunks(&to_embed, progress).await?;
        charged_tokens += self.charge_embeddings(owner_id, &to_embed);
        attach_embeddings(&mut chunks, &embeddings);

        progress(Progress::Stage(Stage::Indexing));
        let total_chunks = chunks.len();
        let mut record = DocumentRecord {
            id: Uuid::new_v4(),
            owner_id,
            filename,
            kind: extracted.kind,
            size_bytes,
            content_hash: extracted.content_hash.clone(),
            page_count: extracted.page_count(),
            chunk_ids: Vec::new(),
            token_count: 0,
            created_at: chrono::Utc::now(),
        };
        let document_id = record.id;

        let mut attempts = 0;
        let added = loop {
            attempts += 1;
            match self.store.add_document(record, chunks)? {
                AddResult::Added(outcome) => break outcome,
                AddResult::Duplicate(existing) => {
                    return Ok(IngestionOutcome::duplicate_of(existing, charged_tokens, start));
                }
                AddResult::MissingEmbeddings {
                    record: returned,
                    chunks: mut returned_chunks,
                    missing,
                } => {
                    if attempts >= MAX_INSERT_ATTEMPTS {
                        return Err(AppError::Internal {
                            message: format!(
                                "{} chunks kept disappearing from the store while {} was ingested",
                                missing.len(),
                                returned.filename
                            ),
                        }
                        .into());
                    }
                    warn!(missing = missing.len(), attempts, "Shared chunks were removed during embedding, re-embedding");

                    let extra: Vec<(ChunkId, String, u32)> = missing
                        .iter()
                        .filter_map(|id| returned_chunks.iter().find(|c| &c.id == id))
                        .map(|c| (c.id.clone(), c.content.clone(), c.token_count))
                        .collect();
                    progress(Progress::Stage(Stage::Embedding));
                    let embeddings = self.embed_chunks(&extra, progress).await?;
                    charged_tokens += self.charge_embeddings(owner_id, &extra);
                    attach_embeddings(&mut returned_chunks, &embeddings);

                    progress(Progress::Stage(Stage::Indexing));
                    record = returned;
                    chunks = returned_chunks;
                }
            }
        };

        self.save_snapshot().await;

        let document = self.store.get_document(document_id).ok_or_else(|| AppError::DocumentNotFound {
            id: document_id.to_string(),
        })?;

        let elapsed = start.elapsed();
        researchdesk_common::metrics::record_ingestion(
            elapsed.as_secs_f64(),
            added.new_chunks,
            added.reused_chunks,
            document.kind.as_str(),
        );
        info!(
            document_id = %document.id,
            chunks = total_chunks,
            new_chunks = added.new_chunks,
            reused_chunks = added.reused_chunks,
            elapsed_ms = elapsed.as_millis() as u64,
            "Document ingested"
        );

        Ok(IngestionOutcome {
            document,
            duplicate: false,
            total_chunks,
            new_chunks: added.new_chunks,
            reused_chunks: added.reused_chunks,
            charged_tokens,
            elapsed,
        })
    }

    /// Record embedding tokens against the owner when configured; returns the tokens charged
    fn charge_embeddings(&self, owner_id: Uuid, embedded: &[(ChunkId, String, u32)]) -> u64 {
        let tokens: u64 = embedded.iter().map(|(_, _, tokens)| *tokens as u64).sum();
        if !self.config.count_embedding_tokens || tokens == 0 {
            return 0;
        }
        self.quota.record(owner_id, tokens, chrono::Utc::now());
        tokens
    }

    /// Embed in batches; each batch holds a permit of the shared semaphore
    async fn embed_chunks(
        &self,
        to_embed: &[(ChunkId, String, u32)],
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<HashMap<ChunkId, Vec<f32>>, IngestionError> {
        let mut embeddings = HashMap::with_capacity(to_embed.len());
        let total = to_embed.len();

        for (batch_no, batch) in to_embed.chunks(self.config.batch_size.max(1)).enumerate() {
            if batch_no > 0 && !self.config.batch_pause.is_zero() {
                tokio::time::sleep(self.config.batch_pause).await;
            }

            let texts: Vec<String> = batch.iter().map(|(_, text, _)| text.clone()).collect();
            let vectors = {
                let _permit = self.permits.acquire().await.map_err(|_| AppError::ServiceUnavailable {
                    message: "Embedding pool is closed".to_string(),
                })?;
                self.embedder.embed_batch(&texts).await?
            };

            if vectors.len() != batch.len() {
                return Err(AppError::EmbeddingError {
                    message: format!("Expected {} embeddings, got {}", batch.len(), vectors.len()),
                }
                .into());
            }

            for ((id, _, _), vector) in batch.iter().zip(vectors) {
                embeddings.insert(id.clone(), vector);
            }
            debug!(done = embeddings.len(), total, "Embedded batch");
            progress(Progress::Embedded {
                done: embeddings.len(),
                total,
            });
        }

        Ok(embeddings)
    }

    /// Persist the store if a snapshot path is configured; failures are logged
    pub async fn save_snapshot(&self) {
        let Some(path) = self.config.snapshot_path.clone() else {
            return;
        };
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save_snapshot(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to save store snapshot"),
            Err(e) => warn!(error = %e, "Snapshot task failed"),
        }
    }
}

fn attach_embeddings(chunks: &mut [NewChunk], embeddings: &HashMap<ChunkId, Vec<f32>>) {
    for chunk in chunks {
        if let Some(embedding) = embeddings.get(&chunk.id) {
            chunk.embedding = Some(embedding.clone());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use parking_lot::Mutex;
    use researchdesk_common::quota::Plan;

    #[tokio::test]
    async fn test_ingest_reports_progress_and_stores_chunks() {
        let pipeline = pipeline();
        let owner = Uuid::new_v4();
        let events = Mutex::new(Vec::new());

        let outcome = pipeline
            .ingest(
                IngestionTask::new(owner, "report.md", None, report_text()),
                &|p| events.lock().push(p),
            )
            .await
            .unwrap();

        assert!(!outcome.duplicate);
        assert_eq!(outcome.total_chunks, 4);
        assert_eq!(outcome.new_chunks, 4);
        assert_eq!(outcome.document.chunk_ids.len(), 4);
        assert_eq!(outcome.document.owner_id, owner);
        assert!(outcome.charged_tokens > 0);

        let events = events.into_inner();
        assert_eq!(events[0], Progress::Stage(Stage::Extracting));
        assert!(events.contains(&Progress::Chunked { total: 4, to_embed: 4 }));
        assert!(events.contains(&Progress::Embedded { done: 2, total: 4 }));
        assert_eq!(events.last(), Some(&Progress::Stage(Stage::Indexing)));

        let usage = pipeline.quota.snapshot(owner, Plan::Free, chrono::Utc::now());
        assert_eq!(usage.daily.used, outcome.charged_tokens);
    }

    #[tokio::test]
    async fn test_reupload_is_deduplicated() {
        let pipeline = pipeline();
        let owner = Uuid::new_v4();

        let first = pipeline
            .ingest(IngestionTask::new(owner, "report.md", None, report_text()), &|_| {})
            .await
            .unwrap();
        let second = pipeline
            .ingest(IngestionTask::new(owner, "copy.md", None, report_text()), &|_| {})
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.document.id, first.document.id);
        assert_eq!(pipeline.store().stats().documents, 1);

        // Another owner shares the chunks but gets a document of their own
        let other = pipeline
            .ingest(IngestionTask::new(Uuid::new_v4(), "report.md", None, report_text()), &|_| {})
            .await
            .unwrap();
        assert!(!other.duplicate);
        assert_eq!(other.new_chunks, 0);
        assert_eq!(other.reused_chunks, 4);
        assert_eq!(pipeline.store().stats().chunks, 4);
    }

    #[tokio::test]
    async fn test_concurrent_identical_uploads_share_one_document() {
        let pipeline = slow_pipeline(Duration::from_millis(50));
        let owner = Uuid::new_v4();

        let (a, b) = tokio::join!(
            pipeline.ingest(IngestionTask::new(owner, "report.md", None, report_text()), &|_| {}),
            pipeline.ingest(IngestionTask::new(owner, "again.md", None, report_text()), &|_| {}),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.document.id, b.document.id);
        assert_eq!([a.duplicate, b.duplicate].iter().filter(|d| **d).count(), 1);
        assert_eq!(pipeline.store().list_documents(owner).len(), 1);
    }

    #[tokio::test]
    async fn test_shared_chunk_deleted_while_embedding() {
        let pipeline = Arc::new(slow_pipeline(Duration::from_millis(200)));
        let owner = Uuid::new_v4();
        let shared = "Cover crops reduced nitrate leaching across all plots in the trial period.";

        let first = pipeline
            .ingest(IngestionTask::new(owner, "a.md", None, report_text()), &|_| {})
            .await
            .unwrap();

        let second_text = format!("{}\n\nA new paragraph about drainage tiles and spring runoff.", shared);
        let task = IngestionTask::new(owner, "b.md", None, second_text.into_bytes());
        let running = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.ingest(task, &|_| {}).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.store().delete_document(owner, first.document.id).unwrap();

        let second = running.await.unwrap().unwrap();
        assert!(!second.duplicate);
        assert_eq!(second.total_chunks, 2);
        assert_eq!(second.new_chunks, 2);
        assert_eq!(pipeline.store().stats().chunks, 2);
        assert_eq!(pipeline.store().keyword_search(owner, "nitrate leaching", 5, None).len(), 1);
    }

    #[tokio::test]
    async fn test_embedding_failure_fails_ingest() {
        let pipeline = failing_pipeline();
        let err = pipeline
            .ingest(IngestionTask::new(Uuid::new_v4(), "report.md", None, report_text()), &|_| {})
            .await
            .unwrap_err();
        assert!(err.to_string().contains("provider returned 401"), "{}", err);
        assert_eq!(pipeline.store().stats().documents, 0);
    }

    #[tokio::test]
    async fn test_empty_and_unsupported_uploads() {
        let pipeline = pipeline();
        let owner = Uuid::new_v4();

        let err = pipeline
            .ingest(IngestionTask::new(owner, "empty.txt", None, Vec::new()), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::EmptyUpload { .. }));

        let err = pipeline
            .ingest(IngestionTask::new(owner, "tool.exe", None, vec![1, 2, 3]), &|_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::UnsupportedFileType { .. }));
    }

    #[tokio::test]
    async fn test_embedding_tokens_not_charged_when_disabled() {
        let limits = [(Plan::Free, researchdesk_common::quota::QuotaLimits::unlimited())]
            .into_iter()
            .collect();
        let pipeline = pipeline_with(
            QuotaTracker::new(true, limits),
            PipelineConfig {
                batch_pause: Duration::ZERO,
                count_embedding_tokens: false,
                ..PipelineConfig::default()
            },
        );
        let owner = Uuid::new_v4();
        let outcome = pipeline
            .ingest(IngestionTask::new(owner, "report.md", None, report_text()), &|_| {})
            .await
            .unwrap();

        assert_eq!(outcome.charged_tokens, 0);
        let usage = pipeline.quota.snapshot(owner, Plan::Free, chrono::Utc::now());
        assert_eq!(usage.daily.used, 0);
    }

    #[tokio::test]
    async fn test_snapshot_written_after_ingest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let limits = [(Plan::Free, researchdesk_common::quota::QuotaLimits::unlimited())]
            .into_iter()
            .collect();
        let pipeline = pipeline_with(
            QuotaTracker::new(false, limits),
            PipelineConfig {
                batch_pause: Duration::ZERO,
                snapshot_path: Some(path.clone()),
                ..PipelineConfig::default()
            },
        );

        pipeline
            .ingest(IngestionTask::new(Uuid::new_v4(), "report.md", None, report_text()), &|_| {})
            .await
            .unwrap();
        assert!(path.exists());
    }
}
