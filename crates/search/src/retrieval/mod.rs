//! Multi-modal retrieval over the knowledge store
//!
//! Provides three retrieval modes:
//! - Vector search (semantic similarity via embeddings)
//! - Keyword search (BM25 lexical matching)
//! - Hybrid search (RRF fusion of vector + keyword)

mod fusion;
mod hybrid;
mod keyword;
mod vector;

pub use fusion::{FusionResult, RRFusion};
pub use hybrid::HybridRetriever;
pub use keyword::KeywordRetriever;
pub use vector::VectorRetriever;

use crate::model::ChunkId;
use crate::store::KnowledgeStore;
use researchdesk_common::embeddings::Embedder;
use researchdesk_common::errors::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Most results one search returns
pub const MAX_SEARCH_LIMIT: usize = 100;

/// Retrieved chunk with relevance score
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: ChunkId,

    /// Document this occurrence belongs to
    pub document_id: Uuid,

    pub filename: String,

    pub content: String,

    /// Chunk index within the document
    pub chunk_index: u32,

    /// 1-based page the chunk came from
    pub page: u32,

    /// Relevance score (0.0 - 1.0)
    pub score: f32,

    pub retrieval_mode: RetrievalMode,
}

/// Retrieval mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Vector similarity search
    Vector,
    /// BM25 lexical search
    Keyword,
    /// Combined hybrid search
    #[default]
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Vector => "vector",
            RetrievalMode::Keyword => "keyword",
            RetrievalMode::Hybrid => "hybrid",
        }
    }
}

/// Search request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Only this user's documents are searched
    pub owner_id: Uuid,

    pub query: String,

    pub mode: RetrievalMode,

    /// Maximum results to return
    pub limit: usize,

    /// Minimum score threshold
    pub min_score: Option<f32>,

    /// Restrict to these documents
    pub document_ids: Option<Vec<Uuid>>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            owner_id: Uuid::nil(),
            query: String::new(),
            mode: RetrievalMode::Hybrid,
            limit: 10,
            min_score: Some(0.2),
            document_ids: None,
        }
    }
}

/// Search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub chunks: Vec<RetrievedChunk>,

    /// Query processing time in milliseconds
    pub query_time_ms: u64,

    pub mode: RetrievalMode,
}

/// Common trait for all retrievers
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve chunks matching the query
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<RetrievedChunk>>;

    /// Get the retrieval mode
    fn mode(&self) -> RetrievalMode;
}

pub(crate) fn apply_min_score(chunks: Vec<RetrievedChunk>, min_score: Option<f32>) -> Vec<RetrievedChunk> {
    let min_score = min_score.unwrap_or(0.0);
    chunks.into_iter().filter(|c| c.score >= min_score).collect()
}

/// Dispatches a request to the retriever for its mode
pub struct SearchService {
    vector: VectorRetriever,
    keyword: KeywordRetriever,
    hybrid: HybridRetriever,
}

impl SearchService {
    pub fn new(store: Arc<KnowledgeStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            vector: VectorRetriever::new(store.clone(), embedder.clone()),
            keyword: KeywordRetriever::new(store.clone()),
            hybrid: HybridRetriever::new(store, embedder),
        }
    }

    fn retriever(&self, mode: RetrievalMode) -> &dyn Retriever {
        match mode {
            RetrievalMode::Vector => &self.vector,
            RetrievalMode::Keyword => &self.keyword,
            RetrievalMode::Hybrid => &self.hybrid,
        }
    }

    #[tracing::instrument(skip(self, request), fields(mode = request.mode.as_str(), limit = request.limit))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let start = Instant::now();
        let chunks = if request.query.trim().is_empty() || request.limit == 0 {
            Vec::new()
        } else if request.limit > MAX_SEARCH_LIMIT {
            let capped = SearchRequest {
                limit: MAX_SEARCH_LIMIT,
                ..request.clone()
            };
            self.retriever(request.mode).retrieve(&capped).await?
        } else {
            self.retriever(request.mode).retrieve(request).await?
        };

        let elapsed = start.elapsed();
        researchdesk_common::metrics::record_search(
            elapsed.as_secs_f64(),
            request.mode.as_str(),
            chunks.len(),
        );
        tracing::debug!(results = chunks.len(), "Search completed");

        Ok(SearchResponse {
            chunks,
            query_time_ms: elapsed.as_millis() as u64,
            mode: request.mode,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::index::HnswParams;
    use crate::model::{DocumentRecord, FileKind, NewChunk};
    use crate::store::{KnowledgeStore, StoreConfig};
    use researchdesk_common::embeddings::{Embedder, HashingEmbedder};
    use std::sync::Arc;
    use uuid::Uuid;

    pub const DIM: usize = 256;

    /// Store seeded with one document per entry of `docs`, each paragraph a chunk
    pub async fn seeded_store(owner: Uuid, docs: &[(&str, Vec<&str>)]) -> (Arc<KnowledgeStore>, Arc<dyn Embedder>, Vec<Uuid>) {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(DIM));
        let store = Arc::new(KnowledgeStore::new(StoreConfig {
            dimension: DIM,
            hnsw: HnswParams::default(),
            exact_search_threshold: 1000,
        }));

        let mut ids = Vec::new();
        for (filename, paragraphs) in docs {
            let texts: Vec<String> = paragraphs.iter().map(|p| p.to_string()).collect();
            let embeddings = embedder.embed_batch(&texts).await.unwrap();
            let chunks = texts
                .into_iter()
                .zip(embeddings)
                .enumerate()
                .map(|(i, (text, embedding))| {
                    let mut chunk = NewChunk::new(text, i as u32, 1, 10);
                    chunk.embedding = Some(embedding);
                    chunk
                })
                .collect();

            let record = DocumentRecord {
                id: Uuid::new_v4(),
                owner_id: owner,
                filename: filename.to_string(),
                kind: FileKind::Text,
                size_bytes: 100,
                content_hash: filename.to_string(),
                page_count: 1,
                chunk_ids: Vec::new(),
                token_count: 0,
                created_at: chrono::Utc::now(),
            };
            ids.push(record.id);
            store.add_document(record, chunks).unwrap();
        }

        (store, embedder, ids)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::seeded_store;
    use super::*;

    #[tokio::test]
    async fn test_search_service_modes() {
        let owner = Uuid::new_v4();
        let (store, embedder, _) = seeded_store(
            owner,
            &[(
                "notes.txt",
                vec![
                    "Photosynthesis converts light energy into chemical energy",
                    "The stock market closed higher on Friday",
                ],
            )],
        )
        .await;
        let service = SearchService::new(store, embedder);

        for mode in [RetrievalMode::Vector, RetrievalMode::Keyword, RetrievalMode::Hybrid] {
            let response = service
                .search(&SearchRequest {
                    owner_id: owner,
                    query: "photosynthesis light energy".to_string(),
                    mode,
                    limit: 5,
                    min_score: None,
                    document_ids: None,
                })
                .await
                .unwrap();

            assert_eq!(response.mode, mode);
            assert!(!response.chunks.is_empty());
            assert!(response.chunks[0].content.starts_with("Photosynthesis"));
            assert!(response.chunks.len() <= 5);
            assert!(response.chunks.windows(2).all(|w| w[0].score >= w[1].score));
        }
    }

    #[tokio::test]
    async fn test_blank_query_returns_nothing() {
        let owner = Uuid::new_v4();
        let (store, embedder, _) = seeded_store(owner, &[("a.txt", vec!["some text here"])]).await;
        let service = SearchService::new(store, embedder);
        let response = service
            .search(&SearchRequest {
                owner_id: owner,
                query: "   ".to_string(),
                ..SearchRequest::default()
            })
            .await
            .unwrap();
        assert!(response.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_limit_is_capped() {
        let owner = Uuid::new_v4();
        let (store, embedder, _) =
            seeded_store(owner, &[("a.txt", vec!["soil nitrate levels", "nitrate runoff after rain"])]).await;
        let service = SearchService::new(store, embedder);

        for mode in [RetrievalMode::Vector, RetrievalMode::Keyword, RetrievalMode::Hybrid] {
            let response = service
                .search(&SearchRequest {
                    owner_id: owner,
                    query: "nitrate".to_string(),
                    mode,
                    limit: usize::MAX,
                    min_score: None,
                    document_ids: None,
                })
                .await
                .unwrap();
            assert!(!response.chunks.is_empty());
            assert!(response.chunks.len() <= MAX_SEARCH_LIMIT);
        }
    }
}
