//! Hierarchical navigable small-world graph
//!
//! Vectors are normalised on insert so that distance is `1 - dot`.
//! Removal leaves a tombstone: the node keeps routing searches but is
//! never returned. Once tombstones outnumber live nodes the owner should
//! call `compact`, which rebuilds the graph from live vectors.

use super::{check_dimension, distance, SearchFilter, VectorIndex};
use crate::model::ChunkId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use researchdesk_common::errors::Result;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone, Copy)]
pub struct HnswParams {
    /// Links per node on upper layers; layer 0 allows `2 * m`
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Seed for level assignment
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
            seed: 0x5eed,
        }
    }
}

struct Node {
    id: ChunkId,
    vector: Vec<f32>,
    /// Adjacency per layer, `0..=level`
    links: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct Candidate {
    distance: f32,
    node: usize,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.node.cmp(&other.node))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct HnswIndex {
    params: HnswParams,
    dimension: usize,
    nodes: Vec<Node>,
    lookup: HashMap<ChunkId, usize>,
    entry_point: Option<usize>,
    max_level: usize,
    level_mult: f64,
    rng: StdRng,
    tombstones: usize,
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        let params = HnswParams {
            m: params.m.max(2),
            ef_construction: params.ef_construction.max(1),
            ef_search: params.ef_search.max(1),
            seed: params.seed,
        };

        Self {
            level_mult: 1.0 / (params.m as f64).ln(),
            rng: StdRng::seed_from_u64(params.seed),
            params,
            dimension,
            nodes: Vec::new(),
            lookup: HashMap::new(),
            entry_point: None,
            max_level: 0,
            tombstones: 0,
        }
    }

    pub fn params(&self) -> HnswParams {
        self.params
    }

    fn layer_cap(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = self.rng.gen();
        let level = (-(1.0 - uniform).ln() * self.level_mult).floor();
        // A cap keeps a pathological draw from building a tall empty tower
        (level as usize).min(16)
    }

    #[inline]
    fn distance_to(&self, query: &[f32], node: usize) -> f32 {
        1.0 - distance::dot(query, &self.nodes[node].vector)
    }

    fn greedy_closest(&self, query: &[f32], mut current: usize, from: usize, to: usize) -> usize {
        let mut current_dist = self.distance_to(query, current);
        for layer in (to..=from).rev() {
            let mut improved = true;
            while improved {
                improved = false;
                let Some(links) = self.nodes[current].links.get(layer) else {
                    break;
                };
                for &neighbor in links {
                    let d = self.distance_to(query, neighbor);
                    if d < current_dist {
                        current_dist = d;
                        current = neighbor;
                        improved = true;
                    }
                }
            }
        }
        current
    }

    /// Beam search on one layer; returns candidates by ascending distance
    fn search_layer(&self, query: &[f32], entry_points: &[usize], ef: usize, layer: usize) -> Vec<Candidate> {
        let mut visited: HashSet<usize> = HashSet::with_capacity(ef.min(self.nodes.len()));
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut best: BinaryHeap<Candidate> = BinaryHeap::new();

        for &ep in entry_points {
            if visited.insert(ep) {
                let c = Candidate {
                    distance: self.distance_to(query, ep),
                    node: ep,
                };
                frontier.push(Reverse(c));
                best.push(c);
            }
        }
        while best.len() > ef {
            best.pop();
        }

        while let Some(Reverse(current)) = frontier.pop() {
            let worst = best.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
            if current.distance > worst && best.len() >= ef {
                break;
            }

            let Some(links) = self.nodes[current.node].links.get(layer) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.distance_to(query, neighbor);
                let worst = best.peek().map(|c| c.distance).unwrap_or(f32::INFINITY);
                if best.len() < ef || d < worst {
                    let c = Candidate {
                        distance: d,
                        node: neighbor,
                    };
                    frontier.push(Reverse(c));
                    best.push(c);
                    if best.len() > ef {
                        best.pop();
                    }
                }
            }
        }

        best.into_sorted_vec()
    }

    /// Keep the `cap` closest links of `node` on `layer`
    fn prune(&mut self, node: usize, layer: usize, cap: usize) {
        let base = &self.nodes[node].vector;
        let mut scored: Vec<Candidate> = self.nodes[node].links[layer]
            .iter()
            .map(|&n| Candidate {
                distance: 1.0 - distance::dot(base, &self.nodes[n].vector),
                node: n,
            })
            .collect();
        scored.sort();
        scored.truncate(cap);
        self.nodes[node].links[layer] = scored.into_iter().map(|c| c.node).collect();
    }

    fn tombstone(&mut self, node: usize) {
        if !self.nodes[node].deleted {
            self.nodes[node].deleted = true;
            self.tombstones += 1;
        }
    }
}

impl VectorIndex for HnswIndex {
    fn insert(&mut self, id: ChunkId, mut vector: Vec<f32>) -> Result<()> {
        check_dimension(self.dimension, vector.len())?;
        distance::normalize(&mut vector);

        if let Some(previous) = self.lookup.remove(&id) {
            self.tombstone(previous);
        }

        let level = self.random_level();
        let new_node = self.nodes.len();
        self.nodes.push(Node {
            id: id.clone(),
            vector,
            links: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.lookup.insert(id, new_node);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(new_node);
            self.max_level = level;
            return Ok(());
        };

        let query = self.nodes[new_node].vector.clone();
        let mut entry_points = vec![entry];
        if level < self.max_level {
            entry_points = vec![self.greedy_closest(&query, entry, self.max_level, level + 1)];
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let candidates = self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let selected: Vec<usize> = candidates
                .iter()
                .filter(|c| c.node != new_node)
                .take(self.params.m)
                .map(|c| c.node)
                .collect();

            self.nodes[new_node].links[layer] = selected.clone();
            let cap = self.layer_cap(layer);
            for neighbor in selected {
                self.nodes[neighbor].links[layer].push(new_node);
                if self.nodes[neighbor].links[layer].len() > cap {
                    self.prune(neighbor, layer, cap);
                }
            }

            entry_points = candidates.into_iter().map(|c| c.node).collect();
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(new_node);
        }
        Ok(())
    }

    fn remove(&mut self, id: &ChunkId) -> bool {
        match self.lookup.remove(id) {
            Some(node) => {
                self.tombstone(node);
                true
            }
            None => false,
        }
    }

    fn search(&self, query: &[f32], k: usize, filter: SearchFilter<'_>) -> Result<Vec<(ChunkId, f32)>> {
        check_dimension(self.dimension, query.len())?;
        let Some(entry) = self.entry_point else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = query.to_vec();
        distance::normalize(&mut query);

        let start = if self.max_level > 0 {
            self.greedy_closest(&query, entry, self.max_level, 1)
        } else {
            entry
        };

        // Widen the beam until enough filtered matches surface; a beam wider
        // than the graph finds nothing more
        let k = k.min(self.nodes.len());
        let mut ef = self.params.ef_search.max(k).min(self.nodes.len());
        loop {
            let candidates = self.search_layer(&query, &[start], ef, 0);
            let matches: Vec<(ChunkId, f32)> = candidates
                .iter()
                .map(|c| &self.nodes[c.node])
                .filter(|n| !n.deleted && filter(&n.id))
                .take(k)
                .map(|n| (n.id.clone(), distance::dot(&query, &n.vector).clamp(-1.0, 1.0)))
                .collect();

            if matches.len() >= k || ef >= self.nodes.len() {
                return Ok(matches);
            }
            ef = (ef * 2).min(self.nodes.len());
        }
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn kind(&self) -> &'static str {
        "hnsw"
    }

    /// True once removed nodes outnumber live ones
    fn needs_compaction(&self) -> bool {
        self.tombstones * 2 > self.nodes.len()
    }

    /// Rebuild the graph from live vectors, dropping tombstones
    fn compact(&mut self) -> Result<()> {
        let nodes = std::mem::take(&mut self.nodes);
        let mut rebuilt = HnswIndex::new(self.dimension, self.params);
        for node in nodes.into_iter().filter(|n| !n.deleted) {
            rebuilt.insert(node.id, node.vector)?;
        }
        tracing::debug!(
            live = rebuilt.len(),
            dropped = self.tombstones,
            "HNSW index compacted"
        );
        *self = rebuilt;
        Ok(())
    }
}
