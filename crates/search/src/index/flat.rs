use super::{check_dimension, distance, SearchFilter, VectorIndex};
use crate::model::ChunkId;
use researchdesk_common::errors::Result;
use std::collections::HashMap;

/// Brute-force exact cosine search
pub struct FlatIndex {
    dimension: usize,
    entries: Vec<(ChunkId, Vec<f32>)>,
    positions: HashMap<ChunkId, usize>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&mut self, id: ChunkId, mut vector: Vec<f32>) -> Result<()> {
        check_dimension(self.dimension, vector.len())?;
        distance::normalize(&mut vector);

        match self.positions.get(&id) {
            Some(&pos) => self.entries[pos].1 = vector,
            None => {
                self.positions.insert(id.clone(), self.entries.len());
                self.entries.push((id, vector));
            }
        }
        Ok(())
    }

    fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(pos) = self.positions.remove(id) else {
            return false;
        };
        self.entries.swap_remove(pos);
        if let Some((moved, _)) = self.entries.get(pos) {
            self.positions.insert(moved.clone(), pos);
        }
        true
    }

    fn search(&self, query: &[f32], k: usize, filter: SearchFilter<'_>) -> Result<Vec<(ChunkId, f32)>> {
        check_dimension(self.dimension, query.len())?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        distance::normalize(&mut query);

        let mut scored: Vec<(ChunkId, f32)> = self
            .entries
            .iter()
            .filter(|(id, _)| filter(id))
            .map(|(id, v)| (id.clone(), distance::dot(&query, v).clamp(-1.0, 1.0)))
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn kind(&self) -> &'static str {
        "flat"
    }
}
