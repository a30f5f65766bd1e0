//! The engine handle.
//!
//! [`MemoryEngine`] owns every component and is the only entry point for
//! callers. Construct it once at startup and share it behind an `Arc`:
//!
//! ```rust,no_run
//! # async fn demo() -> context_memory_core::Result<()> {
//! use std::sync::Arc;
//! use context_memory::config::Config;
//! use context_memory::engine::MemoryEngine;
//!
//! let engine = Arc::new(MemoryEngine::open(Config::with_path("./kb.sqlite")).await?);
//! let ctx = engine.get_context("service layer", 4, None, None).await;
//! # Ok(()) }
//! ```
//!
//! Operations are split across modules by concern: ingestion in
//! [`ingest`](crate::ingest), context building in [`context`](crate::context),
//! QA in [`qa`](crate::qa), secure delete and PII scanning in
//! [`privacy`](crate::privacy).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use context_memory_core::access::{AccessGuard, AuditEntry, Permission};
use context_memory_core::budget::{CharRatioEstimator, TokenEstimator};
use context_memory_core::cache::{CacheHealth, TieredCache};
use context_memory_core::embedding::EmbeddingProvider;
use context_memory_core::models::{MetadataFilter, RetrievedChunk};
use context_memory_core::pii::PiiScanner;
use context_memory_core::profiler::{OperationStats, Profiler};
use context_memory_core::store::{StorageStats, Store};
use context_memory_core::{EngineError, Result};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::llm::{create_language_model, LanguageModel};
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

/// Result of [`MemoryEngine::get_index_health`].
#[derive(Debug, Clone, Serialize)]
pub struct IndexHealth {
    pub cache: CacheHealth,
    pub storage: StorageStats,
}

pub struct MemoryEngine {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    pub(crate) llm: Arc<dyn LanguageModel>,
    pub(crate) cache: TieredCache,
    pub(crate) guard: AccessGuard,
    pub(crate) estimator: Arc<dyn TokenEstimator>,
    pub(crate) profiler: Profiler,
    pub(crate) pii: PiiScanner,
    /// Serializes ingestion, secure delete, and re-linking.
    pub(crate) write_lock: tokio::sync::Mutex<()>,
}

impl MemoryEngine {
    /// Open the SQLite knowledge base named by the config and build the
    /// configured providers.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let pool = db::connect(&config.knowledge_base_path).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        let embedder = create_provider(&config.embedding)?;
        let llm = create_language_model(&config.llm)?;
        tracing::info!(
            path = %config.knowledge_base_path.display(),
            embedder = %embedder.version_tag(),
            llm = llm.name(),
            "knowledge base opened"
        );
        Self::with_components(config, store, embedder, llm)
    }

    /// Build an engine from explicit components.
    pub fn with_components(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;
        let guard = AccessGuard::from_config(&config.security)?;
        let pii = PiiScanner::new()?;
        Ok(Self {
            cache: TieredCache::new(&config.cache),
            guard,
            store,
            embedder,
            llm,
            estimator: Arc::new(CharRatioEstimator::default()),
            profiler: Profiler::new(),
            pii,
            write_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    /// Replace the token estimator used for context budgets.
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.config.retrieval.timeout_secs)
    }

    /// Apply input sanitizing when enabled.
    pub(crate) fn clean_input(&self, text: &str) -> String {
        if self.config.security.sanitize_inputs {
            context_memory_core::access::sanitize_input(text, self.config.security.max_input_chars)
        } else {
            text.to_string()
        }
    }

    /// Embed a batch under the provider timeout.
    pub(crate) async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let provider = self.embedder.provider().to_string();
        match tokio::time::timeout(self.provider_timeout(), self.embedder.embed(texts)).await {
            Ok(Ok(vectors)) if vectors.len() == texts.len() => Ok(vectors),
            Ok(Ok(vectors)) => Err(EngineError::provider(
                provider,
                format!("returned {} vectors for {} inputs", vectors.len(), texts.len()),
            )),
            Ok(Err(e)) => Err(EngineError::provider(provider, format!("{e:#}"))),
            Err(_) => Err(EngineError::provider(
                provider,
                format!("timed out after {:?}", self.provider_timeout()),
            )),
        }
    }

    /// Cache-accelerated similarity search.
    ///
    /// When the embedding provider is unavailable the search degrades to
    /// keyword matching over cached entries instead of failing.
    pub(crate) async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedChunk>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = match self.embed_batch(&[query.to_string()]).await {
            Ok(mut vectors) => vectors.pop().unwrap_or_default(),
            Err(e @ EngineError::ProviderUnavailable { .. }) => {
                tracing::warn!(error = %e, "embedding unavailable, using cache-only retrieval");
                return Ok(self.cache.search_text(query, k, filter));
            }
            Err(e) => return Err(e),
        };

        let scored = self
            .store
            .vector_search(&vector, &self.embedder.version_tag(), k, filter)
            .await?;

        let mut hits = Vec::with_capacity(scored.len());
        // A non-positive cosine means no shared signal with the query.
        for candidate in scored.into_iter().filter(|c| c.score > 0.0) {
            let chunk = match self.cache.get(&candidate.chunk_key) {
                Some(chunk) => chunk,
                None => {
                    let seen = self.cache.epoch();
                    match self.store.get_entry(&candidate.chunk_key).await? {
                        Some(chunk) => {
                            if !self.cache.admit(chunk.clone(), seen) {
                                // Evicted mid-fetch; serve only if still stored.
                                if !self.store.contains(&candidate.chunk_key).await? {
                                    continue;
                                }
                            }
                            chunk
                        }
                        // Deleted between ranking and hydration.
                        None => continue,
                    }
                }
            };
            hits.push(RetrievedChunk {
                chunk_key: chunk.chunk_key,
                text: chunk.text,
                metadata: chunk.metadata,
                score: candidate.score,
            });
        }
        Ok(hits)
    }

    /// Cache and storage health. Always carries both sections, even on an
    /// empty engine.
    pub async fn get_index_health(&self) -> Result<IndexHealth> {
        let _span = self.profiler.span("get_index_health");
        Ok(IndexHealth {
            cache: self.cache.health(),
            storage: self.store.stats().await?,
        })
    }

    /// Empty both cache tiers. The durable index is untouched.
    pub fn clear_cache(&self) {
        let _span = self.profiler.span("clear_cache");
        self.cache.clear();
    }

    pub fn profiler_stats(&self) -> Vec<OperationStats> {
        self.profiler.stats()
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.guard.audit().entries()
    }

    pub fn define_role(&self, actor: Option<&str>, role: &str, permissions: &[Permission]) -> Result<()> {
        let _span = self.profiler.span("define_role");
        self.guard.define_role(actor, role, permissions)
    }

    pub fn assign_role(&self, actor: Option<&str>, user: &str, role: &str) -> Result<()> {
        let _span = self.profiler.span("assign_role");
        self.guard.assign_role(actor, user, role)
    }

    pub fn revoke_user(&self, actor: Option<&str>, user: &str) -> Result<bool> {
        let _span = self.profiler.span("revoke_user");
        self.guard.revoke_user(actor, user)
    }
}
