//! Vector similarity search over the store's index
//!
//! Provides semantic search via embedding similarity

use super::{apply_min_score, RetrievalMode, RetrievedChunk, Retriever, SearchRequest};
use crate::store::KnowledgeStore;
use researchdesk_common::embeddings::Embedder;
use researchdesk_common::errors::Result;
use std::sync::Arc;

/// Vector retriever: embeds the query, then asks the store's index
pub struct VectorRetriever {
    store: Arc<KnowledgeStore>,
    embedder: Arc<dyn Embedder>,
}

impl VectorRetriever {
    pub fn new(store: Arc<KnowledgeStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait::async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<RetrievedChunk>> {
        let embedding = self.embedder.embed(&request.query).await?;

        let chunks = self.store.vector_search(
            request.owner_id,
            &embedding,
            request.limit,
            request.document_ids.as_deref(),
        )?;

        Ok(apply_min_score(chunks, request.min_score))
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Vector
    }
}
