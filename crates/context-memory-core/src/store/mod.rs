//! Storage abstraction for Context Memory.
//!
//! The [`Store`] trait covers both halves of durable state: the vector index
//! (`chunk_key -> vector, text, metadata`) and the document store that links
//! source documents to the content-addressed chunks they produced. Keeping
//! them behind one trait lets a backend delete a chunk from every place it
//! lives in a single transaction.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Document, IndexEntry, MetadataFilter, ScoredKey, StoredChunk};

/// Storage counters reported by [`Store::stats`].
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StorageStats {
    /// Backend name (`"sqlite"`, `"memory"`).
    pub backend: String,
    pub documents: u64,
    pub chunks: u64,
    /// Chunks carrying a non-empty vector.
    pub embedded: u64,
    /// Deleted chunk keys remembered as tombstones.
    pub tombstones: u64,
    /// Distinct embedding version tags present in the index.
    pub models: Vec<String>,
    /// On-disk size, when the backend has one.
    pub size_bytes: Option<u64>,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document, keyed by source path |
/// | [`replace_document_chunks`](Store::replace_document_chunks) | Re-link a document to its chunk keys |
/// | [`upsert_entry`](Store::upsert_entry) | Write an index entry |
/// | [`document_chunks_by_hash`](Store::document_chunks_by_hash) | Keys linked to documents with a given content hash |
/// | [`contains`](Store::contains) | Key existence check |
/// | [`get_entry`](Store::get_entry) | Fetch text and metadata by key |
/// | [`vector_search`](Store::vector_search) | Filtered cosine similarity search |
/// | [`delete_entries`](Store::delete_entries) | Remove entries everywhere and tombstone them |
/// | [`scan_entries`](Store::scan_entries) | Page through all entries in key order |
/// | [`stats`](Store::stats) | Counters for health reporting |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a document.
    ///
    /// Documents are unique by `source_path`; re-ingesting a path keeps its
    /// existing ID. Returns the stored document ID.
    async fn upsert_document(&self, doc: &Document) -> Result<String>;

    /// Replace the set of chunk keys linked to `doc_id`, in order.
    ///
    /// Chunks that were linked before, are no longer linked, and have no
    /// other referencing document are deleted. Returns those purged keys so
    /// callers can evict them from caches.
    async fn replace_document_chunks(&self, doc_id: &str, keys: &[String]) -> Result<Vec<String>>;

    /// Write an index entry.
    ///
    /// With `dedup`, an existing key is left untouched. Without it the entry
    /// is overwritten (re-index). Returns true if the key was not present
    /// before. Writing a key clears any tombstone for it.
    async fn upsert_entry(&self, entry: &IndexEntry, dedup: bool) -> Result<bool>;

    /// Chunk keys linked to every document whose `content_hash` equals
    /// `content_hash`, in link order, without duplicates.
    async fn document_chunks_by_hash(&self, content_hash: &str) -> Result<Vec<String>>;

    async fn contains(&self, key: &str) -> Result<bool>;

    async fn get_entry(&self, key: &str) -> Result<Option<StoredChunk>>;

    /// Rank entries tagged `model` that satisfy `filter` by cosine
    /// similarity to `query_vec`. Ties break on `chunk_key`.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        limit: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredKey>>;

    /// Remove the given keys from the index and from every document link,
    /// drop documents left without chunks, and record tombstones. Returns
    /// the number of index entries removed.
    async fn delete_entries(&self, keys: &[String]) -> Result<usize>;

    /// Page through stored entries ordered by key.
    async fn scan_entries(&self, offset: usize, limit: usize) -> Result<Vec<StoredChunk>>;

    async fn stats(&self) -> Result<StorageStats>;
}

/// Sort scored keys by score (desc) then key (asc), and truncate.
pub fn rank(mut scored: Vec<ScoredKey>, limit: usize) -> Vec<ScoredKey> {
    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_key.cmp(&b.chunk_key))
    });
    scored.truncate(limit);
    scored
}
