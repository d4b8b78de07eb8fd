//! Reciprocal Rank Fusion (RRF) for combining search results
//!
//! RRF is a simple but effective fusion method that:
//! - Doesn't require score normalization
//! - Works well with different scoring distributions
//! - Is robust to outliers

use super::{RetrievalMode, RetrievedChunk};
use crate::model::ChunkId;
use std::collections::HashMap;

/// RRF fusion parameters
#[derive(Debug, Clone)]
pub struct RRFusion {
    /// Constant k (typically 60)
    pub k: f32,

    /// Weight for vector results
    pub vector_weight: f32,

    /// Weight for keyword results
    pub keyword_weight: f32,
}

impl Default for RRFusion {
    fn default() -> Self {
        Self {
            k: 60.0,
            vector_weight: 0.6,
            keyword_weight: 0.4,
        }
    }
}

/// Result of fusion
#[derive(Debug, Clone)]
pub struct FusionResult {
    pub chunk: RetrievedChunk,
    pub vector_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
    pub rrf_score: f32,
}

impl RRFusion {
    /// Fuse vector and keyword results using RRF.
    ///
    /// Scores are normalised so the top result has 1.0.
    pub fn fuse(
        &self,
        vector_results: Vec<RetrievedChunk>,
        keyword_results: Vec<RetrievedChunk>,
        limit: usize,
    ) -> Vec<FusionResult> {
        let mut chunk_map: HashMap<ChunkId, (RetrievedChunk, Option<usize>, Option<usize>)> = HashMap::new();

        for (rank, chunk) in vector_results.into_iter().enumerate() {
            chunk_map
                .entry(chunk.chunk_id.clone())
                .or_insert((chunk, Some(rank + 1), None));
        }

        for (rank, chunk) in keyword_results.into_iter().enumerate() {
            match chunk_map.get_mut(&chunk.chunk_id) {
                Some((_, _, keyword_rank)) => {
                    keyword_rank.get_or_insert(rank + 1);
                }
                None => {
                    chunk_map.insert(chunk.chunk_id.clone(), (chunk, None, Some(rank + 1)));
                }
            }
        }

        let mut results: Vec<FusionResult> = chunk_map
            .into_values()
            .map(|(mut chunk, vector_rank, keyword_rank)| {
                let vector_rrf = vector_rank
                    .map(|r| self.vector_weight / (self.k + r as f32))
                    .unwrap_or(0.0);

                let keyword_rrf = keyword_rank
                    .map(|r| self.keyword_weight / (self.k + r as f32))
                    .unwrap_or(0.0);

                let rrf_score = vector_rrf + keyword_rrf;

                chunk.score = rrf_score;
                chunk.retrieval_mode = RetrievalMode::Hybrid;

                FusionResult {
                    chunk,
                    vector_rank,
                    keyword_rank,
                    rrf_score,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.rrf_score
                .total_cmp(&a.rrf_score)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });

        results.truncate(limit);

        if let Some(max_score) = results.first().map(|r| r.rrf_score) {
            if max_score > 0.0 {
                for result in &mut results {
                    result.rrf_score /= max_score;
                    result.chunk.score = result.rrf_score;
                }
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_chunk(name: &str, score: f32, mode: RetrievalMode) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: ChunkId::from_content(name),
            document_id: Uuid::from_u128(1),
            filename: "test.pdf".to_string(),
            content: name.to_string(),
            chunk_index: 0,
            page: 1,
            score,
            retrieval_mode: mode,
        }
    }

    #[test]
    fn test_rrf_fusion() {
        let fusion = RRFusion::default();

        // Vector:  [A, B, C]
        // Keyword: [B, A, D]
        let vector = vec![
            make_chunk("A", 0.9, RetrievalMode::Vector),
            make_chunk("B", 0.8, RetrievalMode::Vector),
            make_chunk("C", 0.7, RetrievalMode::Vector),
        ];
        let keyword = vec![
            make_chunk("B", 0.9, RetrievalMode::Keyword),
            make_chunk("A", 0.7, RetrievalMode::Keyword),
            make_chunk("D", 0.6, RetrievalMode::Keyword),
        ];

        let results = fusion.fuse(vector, keyword, 10);
        assert_eq!(results.len(), 4);

        // A: 0.6/61 + 0.4/62, B: 0.6/62 + 0.4/61; A wins on the heavier vector weight
        assert_eq!(results[0].chunk.content, "A");
        assert_eq!(results[1].chunk.content, "B");
        assert_eq!(results[0].chunk.score, 1.0);
        assert!(results.iter().all(|r| r.chunk.retrieval_mode == RetrievalMode::Hybrid));
        assert!(results.windows(2).all(|w| w[0].rrf_score >= w[1].rrf_score));

        // Single-list entries rank below entries found by both
        assert!(results[2].vector_rank.is_none() || results[2].keyword_rank.is_none());
    }

    #[test]
    fn test_limit_and_empty() {
        let fusion = RRFusion {
            vector_weight: 0.5,
            keyword_weight: 0.5,
            ..Default::default()
        };
        assert!(fusion.fuse(vec![], vec![], 5).is_empty());

        let vector: Vec<RetrievedChunk> = (0..8)
            .map(|i| make_chunk(&format!("v{}", i), 0.5, RetrievalMode::Vector))
            .collect();
        let results = fusion.fuse(vector, vec![], 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].chunk.content, "v0");
    }
}
