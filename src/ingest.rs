//! Document ingestion: read, chunk, embed, index.
//!
//! # Pipeline
//!
//! ```text
//! file ──▶ split() ──▶ skip known keys (dedup) ──▶ embed new chunks
//!      ──▶ upsert document ──▶ upsert entries ──▶ relink document → keys
//!      ──▶ evict purged keys, write new chunks through to the cache
//! ```
//!
//! Embedding happens before any write, so a provider outage leaves the
//! index untouched.

use std::path::{Path, PathBuf};

use anyhow::Context;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use serde_json::json;
use walkdir::WalkDir;

use context_memory_core::access::Action;
use context_memory_core::chunk::{fingerprint, split};
use context_memory_core::models::{Document, IndexEntry, Metadata, StoredChunk};
use context_memory_core::{EngineError, Result};

use crate::engine::MemoryEngine;

/// Outcome of one [`MemoryEngine::add_document`] call.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IngestReport {
    pub document_id: String,
    pub source_path: String,
    /// Chunks produced by splitting.
    pub chunks: usize,
    /// Chunks newly written to the index.
    pub added: usize,
    /// Chunks already indexed and left untouched.
    pub skipped: usize,
    /// Keys dropped because this document no longer produces them.
    pub purged: usize,
}

/// Outcome of [`MemoryEngine::add_directory`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectoryReport {
    pub ingested: Vec<IngestReport>,
    pub failed: Vec<FailedFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

impl MemoryEngine {
    /// Read UTF-8 text at `path`, chunk it, embed it, and index it.
    ///
    /// `chunk_size` and `chunk_overlap` (characters) override the
    /// configured window for this call only.
    pub async fn add_document(
        &self,
        path: &Path,
        metadata: Option<Metadata>,
        chunk_size: Option<usize>,
        chunk_overlap: Option<usize>,
        user: Option<&str>,
    ) -> Result<IngestReport> {
        let _span = self.profiler.span("add_document");
        let source_path = path.display().to_string();
        self.guard.require(user, Action::Write, &source_path)?;

        if !path.is_file() {
            return Err(EngineError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        let chunking = self.config.chunking.with_window(chunk_size, chunk_overlap)?;
        self.index_text(&source_path, &text, metadata.unwrap_or_default(), &chunking)
            .await
    }

    /// Ingest every file under `dir` whose relative path matches `pattern`.
    ///
    /// Per-file failures are logged and collected, never propagated.
    pub async fn add_directory(
        &self,
        dir: &Path,
        pattern: &str,
        metadata: Option<Metadata>,
        user: Option<&str>,
    ) -> Result<DirectoryReport> {
        let _span = self.profiler.span("add_directory");
        self.guard.require(user, Action::Write, &dir.display().to_string())?;
        if !dir.is_dir() {
            return Err(EngineError::NotFound {
                path: dir.to_path_buf(),
            });
        }
        let matcher = build_globset(pattern)?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in WalkDir::new(dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
            if matcher.is_match(relative) {
                files.push(entry.path().to_path_buf());
            }
        }
        files.sort();

        let mut report = DirectoryReport::default();
        for file in files {
            match self
                .add_document(&file, metadata.clone(), None, None, user)
                .await
            {
                Ok(done) => report.ingested.push(done),
                Err(e) => {
                    tracing::warn!(path = %file.display(), error = %e, "failed to ingest file");
                    report.failed.push(FailedFile {
                        path: file,
                        error: e.to_string(),
                    });
                }
            }
        }
        tracing::info!(
            dir = %dir.display(),
            ingested = report.ingested.len(),
            failed = report.failed.len(),
            "directory ingested"
        );
        Ok(report)
    }

    pub(crate) async fn index_text(
        &self,
        source_path: &str,
        text: &str,
        doc_metadata: Metadata,
        chunking: &context_memory_core::chunk::ChunkingConfig,
    ) -> Result<IngestReport> {
        let chunks: Vec<_> = split(text, chunking)
            .into_iter()
            .filter(|c| !c.text.is_empty())
            .collect();

        let _write = self.write_lock.lock().await;

        let mut pending = Vec::new();
        let mut skipped = 0;
        for chunk in &chunks {
            if chunking.dedup && self.store.contains(&chunk.chunk_key).await? {
                skipped += 1;
            } else {
                pending.push(chunk);
            }
        }

        let texts: Vec<String> = pending.iter().map(|c| c.text.clone()).collect();
        let vectors = if texts.is_empty() {
            Vec::new()
        } else {
            self.embed_batch(&texts).await?
        };
        let model = self.embedder.version_tag();

        let mut document_meta = doc_metadata;
        document_meta.insert("source_path".into(), json!(source_path));
        let document = Document {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: source_path.to_string(),
            metadata: document_meta.clone(),
            ingested_at: chrono::Utc::now().timestamp(),
            content_hash: fingerprint(text),
        };
        let document_id = self.store.upsert_document(&document).await?;

        let mut added = 0;
        for (chunk, vector) in pending.iter().zip(vectors) {
            let mut metadata = document_meta.clone();
            metadata.extend(chunk.metadata.clone());
            let entry = IndexEntry {
                chunk_key: chunk.chunk_key.clone(),
                text: chunk.text.clone(),
                metadata,
                vector,
                model: model.clone(),
            };
            if self.store.upsert_entry(&entry, chunking.dedup).await? {
                added += 1;
            }
            self.cache.put(StoredChunk::from(entry));
        }

        let keys: Vec<String> = chunks.iter().map(|c| c.chunk_key.clone()).collect();
        let purged = self.store.replace_document_chunks(&document_id, &keys).await?;
        self.cache.remove(&purged);

        tracing::info!(
            source = source_path,
            chunks = chunks.len(),
            added,
            skipped,
            purged = purged.len(),
            "document indexed"
        );
        Ok(IngestReport {
            document_id,
            source_path: source_path.to_string(),
            chunks: chunks.len(),
            added,
            skipped,
            purged: purged.len(),
        })
    }
}

fn build_globset(pattern: &str) -> Result<GlobSet> {
    let glob = Glob::new(pattern)
        .map_err(|e| EngineError::validation(format!("invalid glob '{pattern}': {e}")))?;
    let mut builder = GlobSetBuilder::new();
    builder.add(glob);
    builder
        .build()
        .map_err(|e| EngineError::validation(format!("invalid glob '{pattern}': {e}")))
}
