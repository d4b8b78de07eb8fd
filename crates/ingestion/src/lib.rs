//! ResearchDesk ingestion
//!
//! Turns uploaded files into indexed, embedded chunks:
//! - `extract`: per-format text extraction (PDF, DOCX, CSV, XLSX, text, images)
//! - `chunker`: paragraph, semantic and sliding-window chunking
//! - `pipeline`: extract, deduplicate, chunk, embed and store one file
//! - `queue`: bounded background job queue with progress tracking

pub mod chunker;
pub mod errors;
pub mod extract;
pub mod pipeline;
pub mod queue;

pub use chunker::{ChunkStrategy, ChunkingConfig, TextChunk};
pub use errors::IngestionError;
pub use extract::{ExtractedDocument, Extractor, Page};
pub use pipeline::{IngestionOutcome, IngestionPipeline, IngestionTask, PipelineConfig, Progress, Stage};
pub use queue::{IngestionQueue, JobProgress, JobRegistry, JobStatus};
