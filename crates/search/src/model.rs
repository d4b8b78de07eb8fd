//! Records held by the knowledge store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// Content address of a chunk: lowercase hex SHA-256 of its text
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn from_content(content: &str) -> Self {
        Self(hex::encode(Sha256::digest(content.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 hex of arbitrary text, used for document-level dedup
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Source format of an uploaded file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Docx,
    Csv,
    Spreadsheet,
    Text,
    Image,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Pdf => "pdf",
            FileKind::Docx => "docx",
            FileKind::Csv => "csv",
            FileKind::Spreadsheet => "spreadsheet",
            FileKind::Text => "text",
            FileKind::Image => "image",
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ingested document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub filename: String,
    pub kind: FileKind,
    pub size_bytes: u64,
    /// SHA-256 of the extracted text
    pub content_hash: String,
    pub page_count: u32,
    /// Ordered by chunk index
    pub chunk_ids: Vec<ChunkId>,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Where a chunk occurs inside a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub document_id: Uuid,
    pub index: u32,
    pub page: u32,
}

/// A unique piece of text with its embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredChunk {
    pub id: ChunkId,
    pub content: String,
    pub token_count: u32,
    pub embedding: Vec<f32>,
    pub refs: Vec<ChunkRef>,
}

/// Chunk handed to the store when a document is added.
///
/// `embedding` may be `None` only when the store already holds the chunk.
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub id: ChunkId,
    pub content: String,
    pub token_count: u32,
    pub index: u32,
    pub page: u32,
    pub embedding: Option<Vec<f32>>,
}

impl NewChunk {
    pub fn new(content: String, index: u32, page: u32, token_count: u32) -> Self {
        Self {
            id: ChunkId::from_content(&content),
            content,
            token_count,
            index,
            page,
            embedding: None,
        }
    }
}

/// Store-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub index_kind: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_id_is_content_address() {
        let a = ChunkId::from_content("hello world");
        let b = ChunkId::from_content("hello world");
        let c = ChunkId::from_content("hello world!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(
            a.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_chunk_id_serializes_as_string() {
        let id = ChunkId::from_content("x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
    }

    #[test]
    fn test_file_kind_serde() {
        assert_eq!(serde_json::to_string(&FileKind::Spreadsheet).unwrap(), "\"spreadsheet\"");
        assert_eq!(FileKind::Pdf.to_string(), "pdf");
    }
}
