//! Text chunking module
//!
//! Splits extracted pages into chunks for embedding. Chunks never span
//! pages; indexes are contiguous across the document.

use crate::extract::Page;
use researchdesk_common::config::IngestionConfig;
use researchdesk_common::errors::AppError;
use researchdesk_common::tokens::estimate_tokens;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// Accumulate blank-line separated paragraphs
    #[default]
    Paragraph,
    /// Let text-splitter pick semantic boundaries
    Semantic,
    /// Fixed window with overlap, snapped to sentence ends
    Sliding,
}

impl FromStr for ChunkStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paragraph" => Ok(ChunkStrategy::Paragraph),
            "semantic" => Ok(ChunkStrategy::Semantic),
            "sliding" => Ok(ChunkStrategy::Sliding),
            other => Err(AppError::Configuration {
                message: format!("Unknown chunking strategy: {}", other),
            }),
        }
    }
}

/// Configuration for text chunking
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target chunk size in characters
    pub chunk_size: usize,
    /// Overlap between chunks in characters (sliding strategy)
    pub chunk_overlap: usize,
    /// Minimum chunk size (smaller chunks are merged)
    pub min_chunk_size: usize,
    pub strategy: ChunkStrategy,
    /// Derive the chunk size from the document length
    pub adaptive: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
            min_chunk_size: 100,
            strategy: ChunkStrategy::Paragraph,
            adaptive: true,
        }
    }
}

impl ChunkingConfig {
    pub fn from_ingestion_config(config: &IngestionConfig) -> Result<Self, AppError> {
        Ok(Self {
            chunk_size: config.chunk_size.max(1),
            chunk_overlap: config.chunk_overlap,
            min_chunk_size: config.min_chunk_size,
            strategy: config.strategy.parse()?,
            adaptive: config.adaptive_chunk_size,
        })
    }

    /// Chunk size used for a document of `total_chars` characters
    pub fn effective_size(&self, total_chars: usize) -> usize {
        if self.adaptive {
            adaptive_chunk_size(total_chars)
        } else {
            self.chunk_size
        }
    }
}

/// Chunk size heuristic: short documents get small chunks, long ones larger chunks
pub fn adaptive_chunk_size(total_chars: usize) -> usize {
    match total_chars {
        0..=4_999 => 500,
        5_000..=49_999 => 1_000,
        50_000..=499_999 => 1_500,
        _ => 2_000,
    }
}

/// A text chunk with metadata
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    /// Index of this chunk in the document
    pub index: u32,
    /// Page the chunk came from
    pub page: u32,
    /// Approximate token count
    pub token_count: u32,
    /// Start byte offset in the page text
    pub start_pos: usize,
    /// End byte offset in the page text
    pub end_pos: usize,
}

/// Split pages into chunks
pub fn chunk_document(pages: &[Page], config: &ChunkingConfig) -> Vec<TextChunk> {
    let total_chars: usize = pages.iter().map(|p| p.text.chars().count()).sum();
    let size = config.effective_size(total_chars).max(1);

    let mut result = Vec::new();
    for page in pages {
        let spans = match config.strategy {
            ChunkStrategy::Paragraph => paragraph_spans(&page.text, size),
            ChunkStrategy::Semantic => splitter_spans(&page.text, 0, size),
            ChunkStrategy::Sliding => sliding_spans(&page.text, size, config.chunk_overlap),
        };

        for (start, end) in merge_small(&page.text, spans, config.min_chunk_size) {
            let content = page.text[start..end].trim();
            if content.is_empty() {
                continue;
            }
            let lead = page.text[start..end].len() - page.text[start..end].trim_start().len();
            let start_pos = start + lead;

            result.push(TextChunk {
                content: content.to_string(),
                index: result.len() as u32,
                page: page.number,
                token_count: estimate_tokens(content) as u32,
                start_pos,
                end_pos: start_pos + content.len(),
            });
        }
    }

    debug!(
        input_chars = total_chars,
        chunk_count = result.len(),
        chunk_size = size,
        strategy = ?config.strategy,
        "Text chunked"
    );

    result
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Byte ranges of blank-line separated paragraphs, trimmed
fn paragraph_ranges(text: &str) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    let mut para_start: Option<usize> = None;
    let mut para_end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        if line.trim().is_empty() {
            if let Some(start) = para_start.take() {
                ranges.push((start, para_end));
            }
            continue;
        }

        let lead = line.len() - line.trim_start().len();
        if para_start.is_none() {
            para_start = Some(line_start + lead);
        }
        para_end = line_start + line.trim_end().len();
    }
    if let Some(start) = para_start {
        ranges.push((start, para_end));
    }

    ranges
}

/// Accumulate paragraphs until the next one would overflow `size`
fn paragraph_spans(text: &str, size: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (start, end) in paragraph_ranges(text) {
        if char_len(&text[start..end]) > size {
            if let Some(span) = current.take() {
                spans.push(span);
            }
            spans.extend(splitter_spans(&text[start..end], start, size));
            continue;
        }

        current = match current {
            Some((cur_start, _)) if char_len(&text[cur_start..end]) <= size => Some((cur_start, end)),
            Some(span) => {
                spans.push(span);
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some(span) = current {
        spans.push(span);
    }

    spans
}

/// text-splitter chunks of `text`, offset by `base` bytes
fn splitter_spans(text: &str, base: usize, size: usize) -> Vec<(usize, usize)> {
    let splitter = TextSplitter::new(ChunkConfig::new(size));
    splitter
        .chunk_indices(text)
        .map(|(offset, chunk)| (base + offset, base + offset + chunk.len()))
        .collect()
}

/// Windows of up to `size` chars snapped to a sentence end. Each window
/// starts `overlap` chars before the previous one ended.
fn sliding_spans(text: &str, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = boundaries.len() - 1;
    if total_chars == 0 {
        return Vec::new();
    }

    let overlap = if overlap < size { overlap } else { size / 2 };
    let mut spans = Vec::new();
    let mut start = 0;

    while start < total_chars {
        let end = (start + size).min(total_chars);
        let (start_byte, mut end_byte) = (boundaries[start], boundaries[end]);
        let mut snapped_end = end;

        if end < total_chars {
            let search_from = boundaries[start + (end - start) * 4 / 5];
            if let Some(cut) = find_sentence_boundary(&text[search_from..end_byte]) {
                end_byte = search_from + cut;
                snapped_end = boundaries.partition_point(|&b| b < end_byte);
            }
        }
        spans.push((start_byte, end_byte));

        if end == total_chars {
            break;
        }
        start = snapped_end.saturating_sub(overlap).max(start + 1);
    }

    spans
}

/// Byte offset just past the last sentence ending in `region`
fn find_sentence_boundary(region: &str) -> Option<usize> {
    const SENTENCE_ENDINGS: [&str; 6] = [". ", "! ", "? ", ".\n", "!\n", "?\n"];

    SENTENCE_ENDINGS
        .iter()
        .filter_map(|ending| region.rfind(ending).map(|pos| pos + ending.len()))
        .max()
}

/// Fold spans shorter than `min_chars` into the previous span of the page,
/// or into the next one when they open the page. A lone span is kept as is.
fn merge_small(text: &str, spans: Vec<(usize, usize)>, min_chars: usize) -> Vec<(usize, usize)> {
    let is_small = |(start, end): (usize, usize)| char_len(text[start..end].trim()) < min_chars;

    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    let mut carry: Option<usize> = None;

    for span in spans {
        let span = match carry.take() {
            Some(start) => (start, span.1.max(start)),
            None => span,
        };

        if is_small(span) {
            if let Some(last) = merged.last_mut() {
                last.1 = last.1.max(span.1);
            } else {
                carry = Some(span.0);
            }
            continue;
        }
        merged.push(span);
    }

    if let Some(start) = carry {
        match merged.last_mut() {
            Some(last) => last.1 = last.1.max(text.len()),
            None => merged.push((start, text.len())),
        }
    }

    merged
}
