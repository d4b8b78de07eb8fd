//! Nearest-neighbour indexes over chunk embeddings
//!
//! - `FlatIndex`: exact cosine search, used while the store is small
//! - `HnswIndex`: hierarchical navigable small-world graph for larger stores

pub mod distance;
mod flat;
mod hnsw;

pub use flat::FlatIndex;
pub use hnsw::{HnswIndex, HnswParams};

use crate::model::ChunkId;
use researchdesk_common::errors::{AppError, Result};

/// Predicate applied to candidate ids during search
pub type SearchFilter<'a> = &'a (dyn Fn(&ChunkId) -> bool + Sync);

/// Common interface of the vector indexes
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector stored under `id`
    fn insert(&mut self, id: ChunkId, vector: Vec<f32>) -> Result<()>;

    /// Remove `id`; returns whether it was present
    fn remove(&mut self, id: &ChunkId) -> bool;

    /// Up to `k` ids accepted by `filter`, by cosine similarity descending
    fn search(&self, query: &[f32], k: usize, filter: SearchFilter<'_>) -> Result<Vec<(ChunkId, f32)>>;

    /// Live vectors
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn dimension(&self) -> usize;

    /// Short name reported in store stats
    fn kind(&self) -> &'static str;

    /// Whether removed entries should be purged with `compact`
    fn needs_compaction(&self) -> bool {
        false
    }

    fn compact(&mut self) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(AppError::Validation {
            message: format!(
                "Vector dimension mismatch: index holds {}, got {}",
                expected, actual
            ),
            field: Some("embedding".to_string()),
        })
    }
}

/// Accept every id
pub fn no_filter(_: &ChunkId) -> bool {
    true
}
