//! Context assembly - turns retrieved chunks into numbered context windows
//!
//! Provides:
//! - Chunk grouping by document
//! - Stitching of adjacent chunks into one window
//! - Token budget management
//! - Rendering of the numbered context block handed to the chat model

use crate::model::ChunkId;
use crate::retrieval::RetrievedChunk;
use researchdesk_common::config::SearchConfig;
use researchdesk_common::tokens::{estimate_tokens, CHARS_PER_TOKEN};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write;
use uuid::Uuid;

/// Windows are only trimmed to fit when at least this many tokens remain
const MIN_TRIM_TOKENS: usize = 100;

/// Shortest overlap treated as text repeated between neighbouring chunks
const MIN_STITCH_OVERLAP: usize = 16;

/// Context window covering a run of adjacent chunks from one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextWindow {
    pub document_id: Uuid,

    pub filename: String,

    /// Stitched content (combined chunks)
    pub content: String,

    /// Chunk index range (first, last), inclusive
    pub chunk_range: (u32, u32),

    /// Page range (first, last), inclusive
    pub pages: (u32, u32),

    /// Average score of the constituent chunks
    pub relevance_score: f32,

    pub token_count: usize,

    pub chunk_ids: Vec<ChunkId>,
}

impl ContextWindow {
    /// Header line used when rendering, e.g. `report.pdf (pages 2-3)`
    pub fn label(&self) -> String {
        let (first, last) = self.pages;
        if first == last {
            format!("{} (page {})", self.filename, first)
        } else {
            format!("{} (pages {}-{})", self.filename, first, last)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Token budget across all windows
    pub max_tokens: usize,

    pub max_windows: usize,

    /// Longest repeated run (characters) looked for between neighbouring chunks
    pub stitch_overlap: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 3000,
            max_windows: 6,
            stitch_overlap: 200,
        }
    }
}

impl ContextConfig {
    pub fn from_search_config(config: &SearchConfig) -> Self {
        Self {
            max_tokens: config.context_token_budget,
            max_windows: config.max_context_windows,
            ..Self::default()
        }
    }
}

/// Builds context windows from retrieval results
pub struct ContextBuilder {
    config: ContextConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    /// Group, stitch and budget chunks. Windows come back most relevant first.
    pub fn build(&self, chunks: Vec<RetrievedChunk>) -> Vec<ContextWindow> {
        let mut by_document: HashMap<Uuid, Vec<RetrievedChunk>> = HashMap::new();
        for chunk in chunks {
            by_document.entry(chunk.document_id).or_default().push(chunk);
        }

        let mut candidates = Vec::new();
        for (_, mut document_chunks) in by_document {
            document_chunks.sort_by_key(|c| c.chunk_index);
            document_chunks.dedup_by_key(|c| c.chunk_index);

            let mut run: Vec<RetrievedChunk> = Vec::new();
            for chunk in document_chunks {
                let adjacent = run
                    .last()
                    .map(|prev| prev.chunk_index + 1 == chunk.chunk_index)
                    .unwrap_or(true);
                if !adjacent {
                    candidates.push(self.create_window(std::mem::take(&mut run)));
                }
                run.push(chunk);
            }
            if !run.is_empty() {
                candidates.push(self.create_window(run));
            }
        }

        sort_by_relevance(&mut candidates);

        let mut windows = Vec::new();
        let mut total_tokens = 0;

        for window in candidates {
            if windows.len() >= self.config.max_windows {
                break;
            }

            if total_tokens + window.token_count > self.config.max_tokens {
                let remaining = self.config.max_tokens.saturating_sub(total_tokens);
                if remaining >= MIN_TRIM_TOKENS {
                    windows.push(trim_window(window, remaining));
                }
                break;
            }

            total_tokens += window.token_count;
            windows.push(window);
        }

        windows
    }

    /// Render windows as the numbered block `[n] filename (page p)` followed by content
    pub fn render(windows: &[ContextWindow]) -> String {
        let mut out = String::new();
        for (i, window) in windows.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}] {}", i + 1, window.label());
            let _ = writeln!(out, "{}", window.content.trim());
        }
        out
    }

    fn create_window(&self, chunks: Vec<RetrievedChunk>) -> ContextWindow {
        let first = &chunks[0];
        let last = &chunks[chunks.len() - 1];

        let relevance_score = chunks.iter().map(|c| c.score).sum::<f32>() / chunks.len() as f32;
        let content = self.stitch_chunks(&chunks);

        ContextWindow {
            document_id: first.document_id,
            filename: first.filename.clone(),
            token_count: estimate_tokens(&content),
            content,
            chunk_range: (first.chunk_index, last.chunk_index),
            pages: (
                chunks.iter().map(|c| c.page).min().unwrap_or(first.page),
                chunks.iter().map(|c| c.page).max().unwrap_or(last.page),
            ),
            relevance_score,
            chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
        }
    }

    /// Join chunks, dropping text the next chunk repeats from the end of the previous one
    fn stitch_chunks(&self, chunks: &[RetrievedChunk]) -> String {
        let mut result = String::new();

        for chunk in chunks {
            if result.is_empty() {
                result.push_str(&chunk.content);
                continue;
            }

            let overlap = overlap_len(&result, &chunk.content, self.config.stitch_overlap);
            if overlap >= MIN_STITCH_OVERLAP {
                let skip = byte_offset(&chunk.content, overlap);
                result.push_str(&chunk.content[skip..]);
            } else {
                result.push_str("\n\n");
                result.push_str(&chunk.content);
            }
        }

        result
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

fn sort_by_relevance(windows: &mut [ContextWindow]) {
    windows.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| a.document_id.cmp(&b.document_id))
            .then_with(|| a.chunk_range.cmp(&b.chunk_range))
    });
}

/// Longest suffix of `prev` (in chars, at most `max_chars`) that `next` starts with
fn overlap_len(prev: &str, next: &str, max_chars: usize) -> usize {
    let limit = max_chars.min(next.chars().count()).min(prev.chars().count());
    (1..=limit)
        .rev()
        .find(|&n| prev.ends_with(&next[..byte_offset(next, n)]))
        .unwrap_or(0)
}

/// Byte offset of the `chars`-th character
fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Trim window to fit token budget
fn trim_window(window: ContextWindow, max_tokens: usize) -> ContextWindow {
    let max_chars = max_tokens * CHARS_PER_TOKEN;
    let content: String = window.content.chars().take(max_chars).collect();
    let token_count = estimate_tokens(&content);

    ContextWindow {
        content,
        token_count,
        ..window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RetrievalMode;

    fn chunk(document: u128, index: u32, page: u32, content: &str, score: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: ChunkId::from_content(content),
            document_id: Uuid::from_u128(document),
            filename: format!("doc{}.pdf", document),
            content: content.to_string(),
            chunk_index: index,
            page,
            score,
            retrieval_mode: RetrievalMode::Hybrid,
        }
    }

    #[test]
    fn test_adjacent_chunks_share_a_window() {
        let builder = ContextBuilder::default();
        let windows = builder.build(vec![
            chunk(1, 3, 2, "Third part.", 0.5),
            chunk(1, 2, 1, "Second part.", 0.9),
            chunk(1, 7, 4, "Far away part.", 0.4),
            chunk(2, 0, 1, "Other document.", 0.6),
        ]);

        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].chunk_range, (2, 3));
        assert_eq!(windows[0].content, "Second part.\n\nThird part.");
        assert_eq!(windows[0].pages, (1, 2));
        assert_eq!(windows[0].label(), "doc1.pdf (pages 1-2)");
        assert_eq!(windows[1].filename, "doc2.pdf");
        assert_eq!(windows[2].chunk_range, (7, 7));
        assert!(windows.windows(2).all(|w| w[0].relevance_score >= w[1].relevance_score));
    }

    #[test]
    fn test_overlapping_text_is_stitched_once() {
        let builder = ContextBuilder::default();
        let windows = builder.build(vec![
            chunk(1, 0, 1, "Soil samples were dried at sixty degrees overnight.", 0.7),
            chunk(1, 1, 1, "dried at sixty degrees overnight. Then they were weighed.", 0.7),
        ]);

        assert_eq!(windows.len(), 1);
        assert_eq!(
            windows[0].content,
            "Soil samples were dried at sixty degrees overnight. Then they were weighed."
        );
    }

    #[test]
    fn test_stitching_is_char_safe() {
        let builder = ContextBuilder::default();
        let windows = builder.build(vec![
            chunk(1, 0, 1, "Größenordnung der Messwerte für Ökosysteme", 0.6),
            chunk(1, 1, 1, "der Messwerte für Ökosysteme ändert sich über Jahre", 0.6),
        ]);
        assert!(windows[0].content.contains("Ökosysteme ändert"));
        assert_eq!(windows[0].content.matches("Ökosysteme").count(), 1);
    }

    #[test]
    fn test_token_budget_trims_last_window() {
        let builder = ContextBuilder::new(ContextConfig {
            max_tokens: 300,
            max_windows: 10,
            ..ContextConfig::default()
        });
        let long = "a".repeat(800);
        let windows = builder.build(vec![
            chunk(1, 0, 1, &long, 0.9),
            chunk(2, 0, 1, &"b".repeat(800), 0.8),
            chunk(3, 0, 1, "never reached", 0.1),
        ]);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].token_count, 200);
        assert_eq!(windows[1].token_count, 100);
        assert!(windows.iter().map(|w| w.token_count).sum::<usize>() <= 300);
    }

    #[test]
    fn test_small_remainder_is_dropped() {
        let builder = ContextBuilder::new(ContextConfig {
            max_tokens: 250,
            max_windows: 10,
            ..ContextConfig::default()
        });
        let windows = builder.build(vec![
            chunk(1, 0, 1, &"a".repeat(800), 0.9),
            chunk(2, 0, 1, &"b".repeat(800), 0.8),
        ]);
        assert_eq!(windows.len(), 1);
    }

    #[test]
    fn test_window_cap_and_render() {
        let builder = ContextBuilder::new(ContextConfig {
            max_windows: 2,
            ..ContextConfig::default()
        });
        let windows = builder.build(vec![
            chunk(1, 0, 3, "Alpha.", 0.9),
            chunk(2, 0, 1, "Beta.", 0.8),
            chunk(3, 0, 1, "Gamma.", 0.7),
        ]);
        assert_eq!(windows.len(), 2);

        let rendered = ContextBuilder::render(&windows);
        assert_eq!(
            rendered,
            "[1] doc1.pdf (page 3)\nAlpha.\n\n[2] doc2.pdf (page 1)\nBeta.\n"
        );
    }

    #[test]
    fn test_empty_input() {
        assert!(ContextBuilder::default().build(Vec::new()).is_empty());
        assert!(ContextBuilder::render(&[]).is_empty());
    }
}
