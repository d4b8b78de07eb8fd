//! Hybrid retrieval combining vector and keyword search
//!
//! Uses RRF fusion to combine results from both retrievers

use super::{
    apply_min_score, fusion::RRFusion, keyword::KeywordRetriever, vector::VectorRetriever,
    RetrievalMode, RetrievedChunk, Retriever, SearchRequest,
};
use crate::store::KnowledgeStore;
use researchdesk_common::embeddings::Embedder;
use researchdesk_common::errors::Result;
use std::sync::Arc;

/// Hybrid retriever combining vector and keyword search
pub struct HybridRetriever {
    vector: VectorRetriever,
    keyword: KeywordRetriever,
    fusion: RRFusion,
}

impl HybridRetriever {
    pub fn new(store: Arc<KnowledgeStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            vector: VectorRetriever::new(store.clone(), embedder),
            keyword: KeywordRetriever::new(store),
            fusion: RRFusion::default(),
        }
    }
}

#[async_trait::async_trait]
impl Retriever for HybridRetriever {
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<RetrievedChunk>> {
        // Fetch more results from each retriever for better fusion
        let expanded = SearchRequest {
            limit: request.limit.saturating_mul(2),
            min_score: None,
            ..request.clone()
        };

        let (vector_results, keyword_results) = tokio::join!(
            self.vector.retrieve(&expanded),
            self.keyword.retrieve(&expanded)
        );

        // Either leg alone still answers when the other fails
        let (vector_results, keyword_results) = match (vector_results, keyword_results) {
            (Ok(vector), Ok(keyword)) => (vector, keyword),
            (Err(e), Ok(keyword)) => {
                tracing::warn!(error = %e, "Vector leg of hybrid search failed");
                (Vec::new(), keyword)
            }
            (Ok(vector), Err(e)) => {
                tracing::warn!(error = %e, "Keyword leg of hybrid search failed");
                (vector, Vec::new())
            }
            (Err(e), Err(_)) => return Err(e),
        };

        let fused = self.fusion.fuse(vector_results, keyword_results, request.limit);
        let chunks = fused.into_iter().map(|r| r.chunk).collect();

        Ok(apply_min_score(chunks, request.min_score))
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Hybrid
    }
}
