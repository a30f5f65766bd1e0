//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! Uses ordered maps behind a single `parking_lot::RwLock` so every
//! operation sees a consistent snapshot. Vector search is brute-force cosine
//! similarity over all stored vectors.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_similarity;
use crate::models::{matches_filter, Document, IndexEntry, MetadataFilter, ScoredKey, StoredChunk};

use super::{rank, StorageStats, Store};

#[derive(Default)]
struct State {
    docs: HashMap<String, Document>,
    /// source_path -> document id
    paths: HashMap<String, String>,
    /// document id -> ordered chunk keys
    links: HashMap<String, Vec<String>>,
    entries: BTreeMap<String, IndexEntry>,
    tombstones: BTreeMap<String, i64>,
}

impl State {
    fn referenced(&self, key: &str) -> bool {
        self.links.values().any(|keys| keys.iter().any(|k| k == key))
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<String> {
        let mut state = self.state.write();
        let id = state
            .paths
            .get(&doc.source_path)
            .cloned()
            .unwrap_or_else(|| doc.id.clone());
        let mut stored = doc.clone();
        stored.id = id.clone();
        state.paths.insert(doc.source_path.clone(), id.clone());
        state.docs.insert(id.clone(), stored);
        Ok(id)
    }

    async fn replace_document_chunks(&self, doc_id: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut state = self.state.write();
        let previous = state.links.insert(doc_id.to_string(), keys.to_vec()).unwrap_or_default();
        let mut purged = Vec::new();
        for key in previous {
            if keys.contains(&key) || state.referenced(&key) {
                continue;
            }
            if state.entries.remove(&key).is_some() {
                purged.push(key);
            }
        }
        Ok(purged)
    }

    async fn upsert_entry(&self, entry: &IndexEntry, dedup: bool) -> Result<bool> {
        let mut state = self.state.write();
        state.tombstones.remove(&entry.chunk_key);
        let existed = state.entries.contains_key(&entry.chunk_key);
        if existed && dedup {
            return Ok(false);
        }
        state.entries.insert(entry.chunk_key.clone(), entry.clone());
        Ok(!existed)
    }

    async fn document_chunks_by_hash(&self, content_hash: &str) -> Result<Vec<String>> {
        let state = self.state.read();
        let mut doc_ids: Vec<&String> = state
            .docs
            .values()
            .filter(|d| d.content_hash == content_hash)
            .map(|d| &d.id)
            .collect();
        doc_ids.sort();
        let mut keys: Vec<String> = Vec::new();
        for id in doc_ids {
            for key in state.links.get(id).into_iter().flatten() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        Ok(keys)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.state.read().entries.contains_key(key))
    }

    async fn get_entry(&self, key: &str) -> Result<Option<StoredChunk>> {
        Ok(self.state.read().entries.get(key).cloned().map(StoredChunk::from))
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        limit: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredKey>> {
        let state = self.state.read();
        let scored = state
            .entries
            .values()
            .filter(|e| e.model == model && matches_filter(&e.metadata, filter))
            .map(|e| ScoredKey {
                chunk_key: e.chunk_key.clone(),
                score: cosine_similarity(query_vec, &e.vector) as f64,
            })
            .collect();
        Ok(rank(scored, limit))
    }

    async fn delete_entries(&self, keys: &[String]) -> Result<usize> {
        let mut state = self.state.write();
        let now = chrono::Utc::now().timestamp();
        let mut removed = 0;
        for key in keys {
            if state.entries.remove(key).is_some() {
                removed += 1;
                state.tombstones.insert(key.clone(), now);
            }
        }
        let doomed: BTreeSet<&String> = keys.iter().collect();
        for linked in state.links.values_mut() {
            linked.retain(|k| !doomed.contains(k));
        }
        let empty: Vec<String> = state
            .links
            .iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        for doc_id in empty {
            state.links.remove(&doc_id);
            if let Some(doc) = state.docs.remove(&doc_id) {
                state.paths.remove(&doc.source_path);
            }
        }
        Ok(removed)
    }

    async fn scan_entries(&self, offset: usize, limit: usize) -> Result<Vec<StoredChunk>> {
        Ok(self
            .state
            .read()
            .entries
            .values()
            .skip(offset)
            .take(limit)
            .cloned()
            .map(StoredChunk::from)
            .collect())
    }

    async fn stats(&self) -> Result<StorageStats> {
        let state = self.state.read();
        let models: BTreeSet<String> = state.entries.values().map(|e| e.model.clone()).collect();
        Ok(StorageStats {
            backend: "memory".to_string(),
            documents: state.docs.len() as u64,
            chunks: state.entries.len() as u64,
            embedded: state.entries.values().filter(|e| !e.vector.is_empty()).count() as u64,
            tombstones: state.tombstones.len() as u64,
            models: models.into_iter().collect(),
            size_bytes: None,
        })
    }
}
