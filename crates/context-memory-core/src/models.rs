//! Core data models used throughout Context Memory.
//!
//! These types represent the documents, chunks, index entries, and retrieval
//! results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form JSON metadata attached to documents and chunks.
pub type Metadata = serde_json::Map<String, Value>;

/// Equality filter over [`Metadata`]: every key must be present with an
/// identical value.
pub type MetadataFilter = serde_json::Map<String, Value>;

/// A source document as recorded during ingestion.
///
/// The body is not kept; chunk text lives only in the index.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub source_path: String,
    /// Document-level metadata (topic, category, owner, ...), inherited by
    /// every chunk.
    pub metadata: Metadata,
    /// Unix timestamp (seconds) of ingestion.
    pub ingested_at: i64,
    /// Fingerprint of the whole document text.
    pub content_hash: String,
}

/// A bounded slice of a document.
///
/// `chunk_key` is the fingerprint of the normalized text, so identical
/// content always maps to the same key regardless of which document it
/// came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub chunk_key: String,
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Metadata,
}

/// A durable index row: `chunk_key -> (vector, text, metadata)`.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub chunk_key: String,
    pub text: String,
    pub metadata: Metadata,
    pub vector: Vec<f32>,
    /// Provider/version tag of the embedding model that produced `vector`.
    pub model: String,
}

/// An index row without its vector, as served by the cache and `get_entry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_key: String,
    pub text: String,
    pub metadata: Metadata,
}

/// A key/score pair produced by vector search.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredKey {
    pub chunk_key: String,
    pub score: f64,
}

/// A hydrated retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_key: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: f64,
}

impl From<IndexEntry> for StoredChunk {
    fn from(entry: IndexEntry) -> Self {
        Self {
            chunk_key: entry.chunk_key,
            text: entry.text,
            metadata: entry.metadata,
        }
    }
}

/// Returns true when `metadata` satisfies every key of `filter`.
///
/// An empty filter matches everything.
pub fn matches_filter(metadata: &Metadata, filter: &MetadataFilter) -> bool {
    filter
        .iter()
        .all(|(key, expected)| metadata.get(key) == Some(expected))
}

/// Merge two filters; keys in `overrides` win.
pub fn merge_filters(base: &MetadataFilter, overrides: Option<&MetadataFilter>) -> MetadataFilter {
    let mut merged = base.clone();
    if let Some(extra) = overrides {
        for (k, v) in extra {
            merged.insert(k.clone(), v.clone());
        }
    }
    merged
}
