//! BM25 keyword search
//!
//! Provides lexical matching with ranking

use super::{apply_min_score, RetrievalMode, RetrievedChunk, Retriever, SearchRequest};
use crate::store::KnowledgeStore;
use researchdesk_common::errors::Result;
use std::sync::Arc;

/// Keyword retriever backed by the store's BM25 index
pub struct KeywordRetriever {
    store: Arc<KnowledgeStore>,
}

impl KeywordRetriever {
    pub fn new(store: Arc<KnowledgeStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<RetrievedChunk>> {
        let chunks = self.store.keyword_search(
            request.owner_id,
            &request.query,
            request.limit,
            request.document_ids.as_deref(),
        );
        Ok(apply_min_score(chunks, request.min_score))
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Keyword
    }
}
