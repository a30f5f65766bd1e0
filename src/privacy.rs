//! Secure deletion and PII scanning.
//!
//! `secure_delete` accepts either a chunk key or raw content. Content is
//! resolved to keys the same way ingestion derives them, and the full text
//! of an ingested document also resolves through its content hash to every
//! chunk it was linked to, whatever window it was split with.

use std::collections::BTreeSet;

use context_memory_core::access::{Action, AuditOutcome};
use context_memory_core::chunk::{fingerprint, looks_like_key, split};
use context_memory_core::pii::PiiFlag;
use context_memory_core::Result;

use crate::engine::MemoryEngine;

const SCAN_PAGE: usize = 256;

impl MemoryEngine {
    /// Remove every trace of the matching content from the index, the
    /// document store, and both cache tiers.
    ///
    /// Returns `Ok(false)` when nothing matched or the user lacks delete
    /// permission; both outcomes are audited.
    pub async fn secure_delete(&self, key_or_content: &str, user: Option<&str>) -> Result<bool> {
        let _span = self.profiler.span("secure_delete");
        if !self.guard.authorize(user, Action::Delete, "secure_delete").is_allowed() {
            return Ok(false);
        }

        let _write = self.write_lock.lock().await;
        let keys = self.resolve_keys(key_or_content).await?;
        if keys.is_empty() {
            tracing::info!(user = ?user, "secure delete matched nothing");
            return Ok(false);
        }

        let removed = match self.store.delete_entries(&keys).await {
            Ok(removed) => removed,
            Err(e) => {
                self.guard
                    .audit()
                    .record(user, Action::Delete, "secure_delete", AuditOutcome::Failed);
                return Err(e.into());
            }
        };
        let evicted = self.cache.remove(&keys);
        for key in &keys {
            tracing::info!(chunk_key = %key, user = ?user, "chunk securely deleted");
        }
        tracing::debug!(removed, evicted, "secure delete finished");
        Ok(removed > 0)
    }

    /// Keys currently indexed that `input` names directly or produces when
    /// fingerprinted or chunked.
    async fn resolve_keys(&self, input: &str) -> Result<Vec<String>> {
        let mut candidates = BTreeSet::new();
        let trimmed = input.trim();
        if looks_like_key(trimmed) {
            candidates.insert(trimmed.to_string());
        }
        if !trimmed.is_empty() {
            let hash = fingerprint(input);
            candidates.extend(self.store.document_chunks_by_hash(&hash).await?);
            candidates.insert(hash);
            candidates.extend(
                split(input, &self.config.chunking)
                    .into_iter()
                    .filter(|c| !c.text.is_empty())
                    .map(|c| c.chunk_key),
            );
        }

        let mut keys = Vec::new();
        for key in candidates {
            if self.store.contains(&key).await? {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Scan every stored chunk for emails, SSNs, and card numbers.
    pub async fn scan_for_pii(&self, user: Option<&str>) -> Vec<PiiFlag> {
        let _span = self.profiler.span("scan_for_pii");
        if !self.guard.authorize(user, Action::Read, "scan_for_pii").is_allowed() {
            return Vec::new();
        }

        let mut flags = Vec::new();
        let mut offset = 0;
        loop {
            let page = match self.store.scan_entries(offset, SCAN_PAGE).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, offset, "pii scan aborted");
                    self.guard
                        .audit()
                        .record(user, Action::Read, "scan_for_pii", AuditOutcome::Failed);
                    break;
                }
            };
            let n = page.len();
            for chunk in &page {
                flags.extend(self.pii.scan(&chunk.chunk_key, &chunk.text));
            }
            if n < SCAN_PAGE {
                break;
            }
            offset += n;
        }
        tracing::info!(flags = flags.len(), "pii scan finished");
        flags
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use context_memory_core::chunk::ChunkingConfig;
    use context_memory_core::embedding::HashingProvider;
    use context_memory_core::models::Metadata;
    use context_memory_core::pii::PiiKind;
    use context_memory_core::store::memory::InMemoryStore;

    use crate::config::Config;
    use crate::llm::DisabledModel;

    use super::*;

    fn engine() -> MemoryEngine {
        MemoryEngine::with_components(
            Config::with_path("unused.sqlite"),
            Arc::new(InMemoryStore::new()),
            Arc::new(HashingProvider::new(64)),
            Arc::new(DisabledModel),
        )
        .unwrap()
    }

    async fn ingest(engine: &MemoryEngine, path: &str, text: &str) {
        engine
            .index_text(path, text, Metadata::new(), &ChunkingConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_by_content_then_nothing_left() {
        let e = engine();
        let text = "Invoices are archived after ninety days.";
        ingest(&e, "a.txt", text).await;

        assert!(e.secure_delete(text, None).await.unwrap());
        assert!(!e.secure_delete(text, None).await.unwrap());
        assert_eq!(e.get_index_health().await.unwrap().storage.chunks, 0);
    }

    #[tokio::test]
    async fn test_delete_by_key() {
        let e = engine();
        let text = "Keys are SHA-256 fingerprints.";
        ingest(&e, "k.txt", text).await;
        let key = fingerprint(text);

        assert!(e.secure_delete(&key, None).await.unwrap());
        assert!(!e.store.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_content_is_not_matched() {
        let e = engine();
        assert!(!e.secure_delete("never stored", None).await.unwrap());
        assert!(!e.secure_delete("   ", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_finds_email() {
        let e = engine();
        ingest(&e, "p.txt", "Escalations go to ops-lead@example.com first.").await;
        let flags = e.scan_for_pii(None).await;
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].kind, PiiKind::Email);
    }
}
