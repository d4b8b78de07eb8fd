//! In-memory BM25 keyword index over chunks
//!
//! Okapi BM25 with k1 = 1.2, b = 0.75. Raw scores are squashed into
//! `0..1` with `s / (s + 1)` so they can share thresholds with cosine
//! similarity.

use crate::index::SearchFilter;
use crate::model::ChunkId;
use std::collections::{HashMap, HashSet};

const K1: f32 = 1.2;
const B: f32 = 0.75;

const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "been", "but", "by", "can", "did", "do",
    "does", "for", "from", "had", "has", "have", "he", "her", "his", "how", "if", "in", "into",
    "is", "it", "its", "of", "on", "or", "our", "she", "so", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "those", "to", "was", "we", "were", "what",
    "when", "where", "which", "who", "why", "will", "with", "you", "your",
];

/// Lowercase alphanumeric terms of length >= 2 with stop words removed
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

struct IndexedChunk {
    length: u32,
    terms: Vec<String>,
}

#[derive(Default)]
pub struct Bm25Index {
    /// term -> (chunk -> term frequency)
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    chunks: HashMap<ChunkId, IndexedChunk>,
    total_length: u64,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Index `text` under `id`, replacing any previous entry
    pub fn add(&mut self, id: ChunkId, text: &str) {
        self.remove(&id);

        let tokens = tokenize(text);
        let mut freqs: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *freqs.entry(token.clone()).or_default() += 1;
        }

        let length = tokens.len() as u32;
        let mut terms = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.clone(), tf);
            terms.push(term);
        }

        self.total_length += length as u64;
        self.chunks.insert(id, IndexedChunk { length, terms });
    }

    pub fn remove(&mut self, id: &ChunkId) -> bool {
        let Some(entry) = self.chunks.remove(id) else {
            return false;
        };
        self.total_length -= entry.length as u64;
        for term in entry.terms {
            if let Some(list) = self.postings.get_mut(&term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
        true
    }

    fn idf(&self, doc_freq: usize) -> f32 {
        let n = self.chunks.len() as f32;
        let df = doc_freq as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    /// Top `limit` chunks accepted by `filter`, normalised score descending
    pub fn search(&self, query: &str, limit: usize, filter: SearchFilter<'_>) -> Vec<(ChunkId, f32)> {
        if limit == 0 || self.chunks.is_empty() {
            return Vec::new();
        }

        let query_terms: HashSet<String> = tokenize(query).into_iter().collect();
        if query_terms.is_empty() {
            return Vec::new();
        }

        let avg_length = (self.total_length as f32 / self.chunks.len() as f32).max(1.0);
        let mut scores: HashMap<&ChunkId, f32> = HashMap::new();

        for term in &query_terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(list.len());

            for (id, &tf) in list {
                if !filter(id) {
                    continue;
                }
                let length = self.chunks.get(id).map(|c| c.length).unwrap_or(0) as f32;
                let tf = tf as f32;
                let norm = K1 * (1.0 - B + B * length / avg_length);
                *scores.entry(id).or_default() += idf * tf * (K1 + 1.0) / (tf + norm);
            }
        }

        let mut ranked: Vec<(ChunkId, f32)> = scores
            .into_iter()
            .map(|(id, s)| (id.clone(), s / (s + 1.0)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::no_filter;

    fn id(s: &str) -> ChunkId {
        ChunkId::from_content(s)
    }

    fn sample() -> Bm25Index {
        let mut index = Bm25Index::new();
        for text in [
            "Soil nitrogen levels rose after the cover crop trial.",
            "Cover crops reduce erosion on sloped fields.",
            "The committee approved the annual budget.",
        ] {
            index.add(id(text), text);
        }
        index
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("The Quick-brown fox, a 2x speedup in it!"),
            vec!["quick", "brown", "fox", "2x", "speedup"]
        );
    }

    #[test]
    fn test_ranking() {
        let index = sample();
        let results = index.search("cover crop nitrogen", 10, &no_filter);
        assert_eq!(results.len(), 2);
        assert_eq!(
            results[0].0,
            id("Soil nitrogen levels rose after the cover crop trial.")
        );
        assert!(results.iter().all(|(_, s)| *s > 0.0 && *s < 1.0));
        assert!(results[0].1 >= results[1].1);
    }

    #[test]
    fn test_no_match_and_stop_words() {
        let index = sample();
        assert!(index.search("quantum chromodynamics", 5, &no_filter).is_empty());
        assert!(index.search("the and of", 5, &no_filter).is_empty());
    }

    #[test]
    fn test_remove_and_filter() {
        let mut index = sample();
        let erosion = id("Cover crops reduce erosion on sloped fields.");
        assert!(index.remove(&erosion));
        assert!(!index.remove(&erosion));
        assert_eq!(index.len(), 2);
        assert!(index.search("erosion", 5, &no_filter).is_empty());

        let budget = id("The committee approved the annual budget.");
        let only_budget = |c: &ChunkId| *c == budget;
        assert!(index.search("cover crop", 5, &only_budget).is_empty());
        assert_eq!(index.search("annual budget", 5, &only_budget).len(), 1);
    }
}
