//! ResearchDesk search
//!
//! Vector index, content-addressed knowledge store, BM25 keyword index,
//! hybrid retrieval, context assembly and retrieval-augmented answers.

pub mod bm25;
pub mod context;
pub mod index;
pub mod model;
pub mod rag;
pub mod retrieval;
pub mod store;

pub use context::{ContextBuilder, ContextConfig, ContextWindow};
pub use model::{ChunkId, DocumentRecord, FileKind, NewChunk, StoreStats};
pub use rag::{Citation, PreparedQuery, QueryOptions, RagAnswer, RagConfig, RagEngine, Source};
pub use retrieval::{RetrievalMode, RetrievedChunk, SearchRequest, SearchResponse, SearchService, MAX_SEARCH_LIMIT};
pub use store::{AddOutcome, AddResult, KnowledgeStore, StoreConfig};
