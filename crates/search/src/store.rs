//! Content-addressed knowledge store
//!
//! Holds documents, deduplicated chunks, the vector index and the BM25
//! index behind a single `RwLock`. Identical chunk text is stored and
//! indexed once; documents hold references to it. Persistence is a JSON
//! snapshot written to a temporary file and renamed into place; saves are
//! serialised so the newest state always lands last.

use crate::bm25::Bm25Index;
use crate::index::{FlatIndex, HnswIndex, HnswParams, VectorIndex};
use crate::model::{ChunkId, ChunkRef, DocumentRecord, NewChunk, StoreStats, StoredChunk};
use crate::retrieval::{RetrievalMode, RetrievedChunk};
use parking_lot::{Mutex, RwLock};
use researchdesk_common::config::SearchConfig;
use researchdesk_common::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, instrument};
use uuid::Uuid;

const SNAPSHOT_VERSION: u32 = 1;

/// Store tuning
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub dimension: usize,
    pub hnsw: HnswParams,
    /// Stay on exact search until the store holds more vectors than this
    pub exact_search_threshold: usize,
}

impl StoreConfig {
    pub fn from_search_config(config: &SearchConfig, dimension: usize) -> Self {
        Self {
            dimension,
            hnsw: HnswParams {
                m: config.hnsw_m,
                ef_construction: config.ef_construction,
                ef_search: config.ef_search,
                ..HnswParams::default()
            },
            exact_search_threshold: config.exact_search_threshold,
        }
    }
}

/// Counts for a stored document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// Chunks indexed for the first time
    pub new_chunks: usize,
    /// Chunks that already existed and gained a reference
    pub reused_chunks: usize,
}

/// Result of `add_document`
#[derive(Debug)]
pub enum AddResult {
    Added(AddOutcome),
    /// The owner already holds a document with the same content hash
    Duplicate(DocumentRecord),
    /// Chunks without an embedding are not in the store (a shared chunk may
    /// have been deleted meanwhile). Nothing was stored; the inputs are
    /// handed back so the caller can embed `missing` and retry.
    MissingEmbeddings {
        record: DocumentRecord,
        chunks: Vec<NewChunk>,
        missing: Vec<ChunkId>,
    },
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    dimension: usize,
    documents: Vec<DocumentRecord>,
    chunks: Vec<StoredChunk>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    dimension: usize,
    documents: Vec<&'a DocumentRecord>,
    chunks: Vec<&'a StoredChunk>,
}

struct StoreInner {
    documents: HashMap<Uuid, DocumentRecord>,
    chunks: HashMap<ChunkId, StoredChunk>,
    index: Box<dyn VectorIndex>,
    bm25: Bm25Index,
}

pub struct KnowledgeStore {
    config: StoreConfig,
    inner: RwLock<StoreInner>,
    save_lock: Mutex<()>,
}

impl KnowledgeStore {
    pub fn new(config: StoreConfig) -> Self {
        let index: Box<dyn VectorIndex> = Box::new(FlatIndex::new(config.dimension));
        Self {
            inner: RwLock::new(StoreInner {
                documents: HashMap::new(),
                chunks: HashMap::new(),
                index,
                bm25: Bm25Index::new(),
            }),
            save_lock: Mutex::new(()),
            config,
        }
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn build_index(config: &StoreConfig, chunks: &HashMap<ChunkId, StoredChunk>) -> Result<Box<dyn VectorIndex>> {
        let mut ordered: Vec<&StoredChunk> = chunks.values().collect();
        ordered.sort_by(|a, b| a.id.cmp(&b.id));

        let mut index: Box<dyn VectorIndex> = if chunks.len() > config.exact_search_threshold {
            Box::new(HnswIndex::new(config.dimension, config.hnsw))
        } else {
            Box::new(FlatIndex::new(config.dimension))
        };
        for chunk in ordered {
            index.insert(chunk.id.clone(), chunk.embedding.clone())?;
        }
        Ok(index)
    }

    /// Existing document of `owner` whose extracted text hashes to `content_hash`
    pub fn find_duplicate(&self, owner_id: Uuid, content_hash: &str) -> Option<DocumentRecord> {
        let inner = self.inner.read();
        inner
            .documents
            .values()
            .find(|d| d.owner_id == owner_id && d.content_hash == content_hash)
            .cloned()
    }

    pub fn chunk_exists(&self, id: &ChunkId) -> bool {
        self.inner.read().chunks.contains_key(id)
    }

    /// Add a document and its chunks.
    ///
    /// `record.chunk_ids` is rebuilt from `chunks` in index order. Chunks
    /// already present only gain a reference; new chunks must carry an
    /// embedding of the store's dimension. The duplicate check and the
    /// insert happen under one write lock.
    #[instrument(skip(self, record, chunks), fields(document_id = %record.id, chunk_count = chunks.len()))]
    pub fn add_document(&self, mut record: DocumentRecord, mut chunks: Vec<NewChunk>) -> Result<AddResult> {
        chunks.sort_by_key(|c| c.index);

        let mut inner = self.inner.write();
        if inner.documents.contains_key(&record.id) {
            return Err(AppError::Duplicate {
                message: format!("Document {} already exists", record.id),
            });
        }
        if let Some(existing) = inner
            .documents
            .values()
            .find(|d| d.owner_id == record.owner_id && d.content_hash == record.content_hash)
        {
            return Ok(AddResult::Duplicate(existing.clone()));
        }

        // Validate before mutating so a bad chunk leaves the store untouched
        let mut pending: HashSet<&ChunkId> = HashSet::new();
        let mut missing: Vec<ChunkId> = Vec::new();
        for chunk in &chunks {
            if inner.chunks.contains_key(&chunk.id) || pending.contains(&chunk.id) {
                continue;
            }
            match &chunk.embedding {
                Some(e) if e.len() == self.config.dimension => {
                    pending.insert(&chunk.id);
                }
                Some(e) => {
                    return Err(AppError::Validation {
                        message: format!(
                            "Chunk {} has dimension {}, store expects {}",
                            chunk.index,
                            e.len(),
                            self.config.dimension
                        ),
                        field: Some("embedding".to_string()),
                    })
                }
                None => {
                    if !missing.contains(&chunk.id) {
                        missing.push(chunk.id.clone());
                    }
                }
            }
        }
        if !missing.is_empty() {
            debug!(missing = missing.len(), "New chunks arrived without embeddings");
            return Ok(AddResult::MissingEmbeddings { record, chunks, missing });
        }

        let mut outcome = AddOutcome {
            new_chunks: 0,
            reused_chunks: 0,
        };
        record.chunk_ids = Vec::with_capacity(chunks.len());
        record.token_count = 0;

        for chunk in chunks {
            let reference = ChunkRef {
                document_id: record.id,
                index: chunk.index,
                page: chunk.page,
            };
            record.chunk_ids.push(chunk.id.clone());
            record.token_count += chunk.token_count as u64;

            if let Some(existing) = inner.chunks.get_mut(&chunk.id) {
                existing.refs.push(reference);
                outcome.reused_chunks += 1;
                continue;
            }

            let embedding = chunk.embedding.unwrap_or_default();
            inner.index.insert(chunk.id.clone(), embedding.clone())?;
            inner.bm25.add(chunk.id.clone(), &chunk.content);
            inner.chunks.insert(
                chunk.id.clone(),
                StoredChunk {
                    id: chunk.id,
                    content: chunk.content,
                    token_count: chunk.token_count,
                    embedding,
                    refs: vec![reference],
                },
            );
            outcome.new_chunks += 1;
        }

        inner.documents.insert(record.id, record);

        if inner.index.kind() == "flat" && inner.index.len() > self.config.exact_search_threshold {
            info!(vectors = inner.index.len(), "Switching to HNSW index");
            inner.index = Self::build_index(&self.config, &inner.chunks)?;
        }

        debug!(new = outcome.new_chunks, reused = outcome.reused_chunks, "Document stored");
        Ok(AddResult::Added(outcome))
    }

    pub fn get_document(&self, id: Uuid) -> Option<DocumentRecord> {
        self.inner.read().documents.get(&id).cloned()
    }

    /// Documents of `owner`, newest first
    pub fn list_documents(&self, owner_id: Uuid) -> Vec<DocumentRecord> {
        let inner = self.inner.read();
        let mut docs: Vec<DocumentRecord> = inner
            .documents
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        docs
    }

    /// Chunk text of a document in index order
    pub fn document_chunks(&self, id: Uuid) -> Vec<(u32, u32, String)> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        let Some(doc) = inner.documents.get(&id) else {
            return out;
        };
        for chunk_id in &doc.chunk_ids {
            if let Some(chunk) = inner.chunks.get(chunk_id) {
                for r in chunk.refs.iter().filter(|r| r.document_id == id) {
                    out.push((r.index, r.page, chunk.content.clone()));
                }
            }
        }
        out.sort_by_key(|(index, _, _)| *index);
        out.dedup_by_key(|(index, _, _)| *index);
        out
    }

    /// Delete a document; chunks left without references are dropped
    #[instrument(skip(self))]
    pub fn delete_document(&self, owner_id: Uuid, id: Uuid) -> Result<DocumentRecord> {
        let mut inner = self.inner.write();

        match inner.documents.get(&id) {
            None => {
                return Err(AppError::DocumentNotFound { id: id.to_string() });
            }
            Some(doc) if doc.owner_id != owner_id => {
                return Err(AppError::Forbidden {
                    message: "Document belongs to another user".to_string(),
                });
            }
            Some(_) => {}
        }

        let record = inner
            .documents
            .remove(&id)
            .ok_or_else(|| AppError::DocumentNotFound { id: id.to_string() })?;

        let mut removed = 0;
        let unique: HashSet<&ChunkId> = record.chunk_ids.iter().collect();
        for chunk_id in unique {
            let orphaned = match inner.chunks.get_mut(chunk_id) {
                Some(chunk) => {
                    chunk.refs.retain(|r| r.document_id != id);
                    chunk.refs.is_empty()
                }
                None => false,
            };
            if orphaned {
                inner.chunks.remove(chunk_id);
                inner.index.remove(chunk_id);
                inner.bm25.remove(chunk_id);
                removed += 1;
            }
        }

        if inner.index.needs_compaction() {
            inner.index.compact()?;
            debug!(live = inner.index.len(), "Vector index compacted after delete");
        }

        info!(document_id = %id, removed_chunks = removed, "Document deleted");
        Ok(record)
    }

    /// Allowed chunk ids for `owner`, optionally restricted to `document_ids`
    fn visible_chunks<'a>(
        inner: &'a StoreInner,
        owner_id: Uuid,
        document_ids: Option<&[Uuid]>,
    ) -> HashMap<&'a ChunkId, Vec<&'a DocumentRecord>> {
        let mut visible: HashMap<&ChunkId, Vec<&DocumentRecord>> = HashMap::new();
        for doc in inner.documents.values() {
            if doc.owner_id != owner_id {
                continue;
            }
            if let Some(ids) = document_ids {
                if !ids.contains(&doc.id) {
                    continue;
                }
            }
            for chunk_id in &doc.chunk_ids {
                visible.entry(chunk_id).or_default().push(doc);
            }
        }
        visible
    }

    fn to_retrieved(
        inner: &StoreInner,
        chunk_id: &ChunkId,
        docs: &[&DocumentRecord],
        score: f32,
        mode: RetrievalMode,
    ) -> Option<RetrievedChunk> {
        let chunk = inner.chunks.get(chunk_id)?;
        // Deterministic pick when the same text occurs in several documents
        let doc = docs.iter().min_by_key(|d| (d.created_at, d.id))?;
        let reference = chunk.refs.iter().find(|r| r.document_id == doc.id)?;

        Some(RetrievedChunk {
            chunk_id: chunk.id.clone(),
            document_id: doc.id,
            filename: doc.filename.clone(),
            content: chunk.content.clone(),
            chunk_index: reference.index,
            page: reference.page,
            score: score.clamp(0.0, 1.0),
            retrieval_mode: mode,
        })
    }

    /// Nearest chunks to `embedding` among the owner's documents
    pub fn vector_search(
        &self,
        owner_id: Uuid,
        embedding: &[f32],
        limit: usize,
        document_ids: Option<&[Uuid]>,
    ) -> Result<Vec<RetrievedChunk>> {
        let inner = self.inner.read();
        let visible = Self::visible_chunks(&inner, owner_id, document_ids);
        if visible.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let filter = |id: &ChunkId| visible.contains_key(id);
        let hits = inner.index.search(embedding, limit, &filter)?;

        Ok(hits
            .into_iter()
            .filter_map(|(id, score)| {
                let docs = visible.get(&id)?;
                Self::to_retrieved(&inner, &id, docs, score, RetrievalMode::Vector)
            })
            .collect())
    }

    /// BM25 matches for `query` among the owner's documents
    pub fn keyword_search(
        &self,
        owner_id: Uuid,
        query: &str,
        limit: usize,
        document_ids: Option<&[Uuid]>,
    ) -> Vec<RetrievedChunk> {
        let inner = self.inner.read();
        let visible = Self::visible_chunks(&inner, owner_id, document_ids);
        if visible.is_empty() || limit == 0 {
            return Vec::new();
        }

        let filter = |id: &ChunkId| visible.contains_key(id);
        inner
            .bm25
            .search(query, limit, &filter)
            .into_iter()
            .filter_map(|(id, score)| {
                let docs = visible.get(&id)?;
                Self::to_retrieved(&inner, &id, docs, score, RetrievalMode::Keyword)
            })
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            documents: inner.documents.len(),
            chunks: inner.chunks.len(),
            vectors: inner.index.len(),
            index_kind: inner.index.kind(),
        }
    }

    /// Write the store to `path` atomically
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        // Held across serialise and rename so an older state never replaces a newer one
        let _saving = self.save_lock.lock();

        let bytes = {
            let inner = self.inner.read();
            let mut documents: Vec<&DocumentRecord> = inner.documents.values().collect();
            documents.sort_by_key(|d| (d.created_at, d.id));
            let mut chunks: Vec<&StoredChunk> = inner.chunks.values().collect();
            chunks.sort_by(|a, b| a.id.cmp(&b.id));

            serde_json::to_vec(&SnapshotRef {
                version: SNAPSHOT_VERSION,
                dimension: self.config.dimension,
                documents,
                chunks,
            })?
        };

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        // Unique temp file in the target directory, so other processes
        // saving to the same path cannot clobber it
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| AppError::from(e.error))?;

        debug!(bytes = bytes.len(), "Snapshot written");
        Ok(())
    }

    /// Replace the store contents with the snapshot at `path`.
    ///
    /// A missing file leaves the store empty.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load_snapshot(&self, path: &Path) -> Result<()> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot found, starting empty");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(AppError::Storage {
                message: format!("Unsupported snapshot version {}", snapshot.version),
            });
        }
        if snapshot.dimension != self.config.dimension {
            return Err(AppError::Configuration {
                message: format!(
                    "Snapshot embeddings have dimension {}, embedder produces {}",
                    snapshot.dimension, self.config.dimension
                ),
            });
        }

        let chunks: HashMap<ChunkId, StoredChunk> = snapshot
            .chunks
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
        let documents: HashMap<Uuid, DocumentRecord> = snapshot
            .documents
            .into_iter()
            .map(|d| (d.id, d))
            .collect();

        let index = Self::build_index(&self.config, &chunks)?;
        let mut bm25 = Bm25Index::new();
        for chunk in chunks.values() {
            bm25.add(chunk.id.clone(), &chunk.content);
        }

        info!(
            documents = documents.len(),
            chunks = chunks.len(),
            index = index.kind(),
            "Snapshot loaded"
        );

        *self.inner.write() = StoreInner {
            documents,
            chunks,
            index,
            bm25,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileKind;
    use chrono::Utc;

    const DIM: usize = 4;

    fn store() -> KnowledgeStore {
        KnowledgeStore::new(StoreConfig {
            dimension: DIM,
            hnsw: HnswParams::default(),
            exact_search_threshold: 100,
        })
    }

    fn record(owner: Uuid, name: &str, hash: &str) -> DocumentRecord {
        DocumentRecord {
            id: Uuid::new_v4(),
            owner_id: owner,
            filename: name.to_string(),
            kind: FileKind::Text,
            size_bytes: 10,
            content_hash: hash.to_string(),
            page_count: 1,
            chunk_ids: Vec::new(),
            token_count: 0,
            created_at: Utc::now(),
        }
    }

    fn chunk(text: &str, index: u32, embedding: [f32; DIM]) -> NewChunk {
        let mut c = NewChunk::new(text.to_string(), index, 1, 5);
        c.embedding = Some(embedding.to_vec());
        c
    }

    fn added(result: Result<AddResult>) -> AddOutcome {
        match result.unwrap() {
            AddResult::Added(outcome) => outcome,
            other => panic!("expected the document to be stored, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_chunks_stored_once() {
        let store = store();
        let owner = Uuid::new_v4();

        let a = record(owner, "a.txt", "h1");
        let out = added(store.add_document(
            a.clone(),
            vec![
                chunk("shared intro", 0, [1.0, 0.0, 0.0, 0.0]),
                chunk("only in a", 1, [0.0, 1.0, 0.0, 0.0]),
            ],
        ));
        assert_eq!(out, AddOutcome { new_chunks: 2, reused_chunks: 0 });

        let b = record(owner, "b.txt", "h2");
        let mut reused = NewChunk::new("shared intro".to_string(), 0, 1, 5);
        reused.embedding = None;
        let out = added(store.add_document(b.clone(), vec![reused, chunk("only in b", 1, [0.0, 0.0, 1.0, 0.0])]));
        assert_eq!(out, AddOutcome { new_chunks: 1, reused_chunks: 1 });

        let stats = store.stats();
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.chunks, 3);
        assert_eq!(stats.vectors, 3);
        assert_eq!(stats.index_kind, "flat");

        let stored = store.get_document(b.id).unwrap();
        assert_eq!(stored.chunk_ids[0], ChunkId::from_content("shared intro"));
        assert_eq!(stored.token_count, 10);
    }

    #[test]
    fn test_new_chunk_requires_embedding() {
        let store = store();
        let owner = Uuid::new_v4();
        let bare = NewChunk::new("text".to_string(), 0, 1, 1);
        match store.add_document(record(owner, "x", "h"), vec![bare]).unwrap() {
            AddResult::MissingEmbeddings { missing, chunks, .. } => {
                assert_eq!(missing, vec![ChunkId::from_content("text")]);
                assert_eq!(chunks.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        let wrong = {
            let mut c = NewChunk::new("text".to_string(), 0, 1, 1);
            c.embedding = Some(vec![1.0]);
            c
        };
        assert!(store.add_document(record(owner, "x", "h"), vec![wrong]).is_err());
        assert_eq!(store.stats().documents, 0);
        assert_eq!(store.stats().chunks, 0);
    }

    #[test]
    fn test_same_content_from_same_owner_is_a_duplicate() {
        let store = store();
        let owner = Uuid::new_v4();
        let first = record(owner, "a.txt", "samehash");
        added(store.add_document(first.clone(), vec![chunk("x", 0, [1.0, 0.0, 0.0, 0.0])]));

        // Second writer raced past `find_duplicate`; the store still catches it
        let result = store
            .add_document(record(owner, "copy.txt", "samehash"), vec![chunk("x", 0, [1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        assert!(matches!(result, AddResult::Duplicate(ref existing) if existing.id == first.id));
        assert_eq!(store.stats().documents, 1);

        let other_owner = store
            .add_document(record(Uuid::new_v4(), "a.txt", "samehash"), vec![chunk("x", 0, [1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        assert!(matches!(other_owner, AddResult::Added(_)));
    }

    #[test]
    fn test_shared_chunk_deleted_before_insert() {
        let store = store();
        let owner = Uuid::new_v4();
        let a = record(owner, "a.txt", "h1");
        added(store.add_document(a.clone(), vec![chunk("shared", 0, [1.0, 0.0, 0.0, 0.0])]));

        // `b` was prepared while "shared" existed, so it carries no embedding for it
        let mut stale = NewChunk::new("shared".to_string(), 0, 1, 5);
        stale.embedding = None;
        let b = record(owner, "b.txt", "h2");
        store.delete_document(owner, a.id).unwrap();

        let (doc, mut chunks, missing) = match store.add_document(b, vec![stale, chunk("b only", 1, [0.0, 1.0, 0.0, 0.0])]).unwrap() {
            AddResult::MissingEmbeddings { record, chunks, missing } => (record, chunks, missing),
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(missing, vec![ChunkId::from_content("shared")]);
        assert_eq!(store.stats().documents, 0);
        assert_eq!(store.stats().chunks, 0);

        for c in chunks.iter_mut().filter(|c| missing.contains(&c.id)) {
            c.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        }
        let out = added(store.add_document(doc, chunks));
        assert_eq!(out, AddOutcome { new_chunks: 2, reused_chunks: 0 });
    }

    #[test]
    fn test_search_is_owner_scoped() {
        let store = store();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let doc_a = record(alice, "alice.txt", "ha");
        store
            .add_document(doc_a.clone(), vec![chunk("alice notes on glaciers", 0, [1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        store
            .add_document(record(bob, "bob.txt", "hb"), vec![chunk("bob notes on glaciers", 0, [0.9, 0.1, 0.0, 0.0])])
            .unwrap();

        let hits = store.vector_search(alice, &[1.0, 0.0, 0.0, 0.0], 10, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, doc_a.id);
        assert_eq!(hits[0].filename, "alice.txt");
        assert!(hits[0].score <= 1.0 && hits[0].score > 0.99);

        let keyword = store.keyword_search(alice, "glaciers", 10, None);
        assert_eq!(keyword.len(), 1);
        assert_eq!(keyword[0].retrieval_mode, RetrievalMode::Keyword);

        let nobody = store.vector_search(Uuid::new_v4(), &[1.0, 0.0, 0.0, 0.0], 10, None).unwrap();
        assert!(nobody.is_empty());
    }

    #[test]
    fn test_document_filter() {
        let store = store();
        let owner = Uuid::new_v4();
        let first = record(owner, "1.txt", "h1");
        let second = record(owner, "2.txt", "h2");
        store.add_document(first.clone(), vec![chunk("first", 0, [1.0, 0.0, 0.0, 0.0])]).unwrap();
        store.add_document(second.clone(), vec![chunk("second", 0, [1.0, 0.0, 0.0, 0.0])]).unwrap();

        let hits = store
            .vector_search(owner, &[1.0, 0.0, 0.0, 0.0], 10, Some(&[second.id]))
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, second.id);
    }

    #[test]
    fn test_delete_document() {
        let store = store();
        let owner = Uuid::new_v4();
        let a = record(owner, "a.txt", "h1");
        let b = record(owner, "b.txt", "h2");
        store.add_document(a.clone(), vec![chunk("shared", 0, [1.0, 0.0, 0.0, 0.0]), chunk("a only", 1, [0.0, 1.0, 0.0, 0.0])]).unwrap();
        store.add_document(b.clone(), vec![chunk("shared", 0, [1.0, 0.0, 0.0, 0.0])]).unwrap();

        assert!(matches!(
            store.delete_document(Uuid::new_v4(), a.id),
            Err(AppError::Forbidden { .. })
        ));
        assert!(matches!(
            store.delete_document(owner, Uuid::new_v4()),
            Err(AppError::DocumentNotFound { .. })
        ));

        store.delete_document(owner, a.id).unwrap();
        let stats = store.stats();
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 1);
        assert_eq!(stats.vectors, 1);
        assert!(store.chunk_exists(&ChunkId::from_content("shared")));
        assert!(!store.chunk_exists(&ChunkId::from_content("a only")));
        assert!(store.keyword_search(owner, "only", 10, None).is_empty());
    }

    #[test]
    fn test_find_duplicate() {
        let store = store();
        let owner = Uuid::new_v4();
        let doc = record(owner, "a.txt", "samehash");
        store.add_document(doc.clone(), vec![chunk("x", 0, [1.0, 0.0, 0.0, 0.0])]).unwrap();

        assert_eq!(store.find_duplicate(owner, "samehash").map(|d| d.id), Some(doc.id));
        assert!(store.find_duplicate(Uuid::new_v4(), "samehash").is_none());
        assert!(store.find_duplicate(owner, "other").is_none());
    }

    #[test]
    fn test_switches_to_hnsw_above_threshold() {
        let store = KnowledgeStore::new(StoreConfig {
            dimension: DIM,
            hnsw: HnswParams::default(),
            exact_search_threshold: 3,
        });
        let owner = Uuid::new_v4();
        let chunks: Vec<NewChunk> = (0..5)
            .map(|i| chunk(&format!("chunk {}", i), i, [1.0, i as f32, 0.0, 0.0]))
            .collect();
        store.add_document(record(owner, "big.txt", "h"), chunks).unwrap();

        assert_eq!(store.stats().index_kind, "hnsw");
        let hits = store.vector_search(owner, &[1.0, 0.0, 0.0, 0.0], 2, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_index, 0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let store = store();
        let owner = Uuid::new_v4();
        let doc = record(owner, "a.txt", "h1");
        store
            .add_document(doc.clone(), vec![chunk("alpha beta", 0, [1.0, 0.0, 0.0, 0.0]), chunk("gamma delta", 1, [0.0, 1.0, 0.0, 0.0])])
            .unwrap();
        store.save_snapshot(&path).unwrap();
        assert!(path.exists());

        let restored = KnowledgeStore::new(StoreConfig {
            dimension: DIM,
            hnsw: HnswParams::default(),
            exact_search_threshold: 100,
        });
        restored.load_snapshot(&path).unwrap();
        assert_eq!(restored.stats(), store.stats());
        assert_eq!(restored.keyword_search(owner, "gamma", 5, None).len(), 1);
        assert_eq!(restored.document_chunks(doc.id).len(), 2);
    }

    #[test]
    fn test_concurrent_saves_to_one_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = std::sync::Arc::new(store());
        let owner = Uuid::new_v4();
        added(store.add_document(record(owner, "a.txt", "h1"), vec![chunk("alpha", 0, [1.0, 0.0, 0.0, 0.0])]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let path = path.clone();
                std::thread::spawn(move || (0..10).map(|_| store.save_snapshot(&path)).collect::<Vec<_>>())
            })
            .collect();
        for handle in handles {
            for result in handle.join().unwrap() {
                assert!(result.is_ok(), "save failed: {:?}", result);
            }
        }

        let restored = KnowledgeStore::new(StoreConfig {
            dimension: DIM,
            hnsw: HnswParams::default(),
            exact_search_threshold: 100,
        });
        restored.load_snapshot(&path).unwrap();
        assert_eq!(restored.stats().documents, 1);
        // Only the snapshot itself is left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_load_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store();
        store.load_snapshot(&dir.path().join("absent.json")).unwrap();
        assert_eq!(store.stats().documents, 0);
    }

    #[test]
    fn test_snapshot_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        store().save_snapshot(&path).unwrap();

        let other = KnowledgeStore::new(StoreConfig {
            dimension: 8,
            hnsw: HnswParams::default(),
            exact_search_threshold: 100,
        });
        assert!(matches!(other.load_snapshot(&path), Err(AppError::Configuration { .. })));
    }
}
