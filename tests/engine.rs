use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::{oneshot, Notify};

use context_memory::config::Config;
use context_memory::engine::MemoryEngine;
use context_memory::llm::{ChatTurn, CompletionRequest, DisabledModel, LanguageModel};
use context_memory::qa::{QaRequest, QaResponse};
use context_memory::sqlite_store::SqliteStore;
use context_memory::{db, migrate, EngineError};
use context_memory_core::access::{Action, AuditOutcome};
use context_memory_core::budget::{CharRatioEstimator, TokenEstimator};
use context_memory_core::embedding::{EmbeddingProvider, HashingProvider};
use context_memory_core::models::{
    Document, IndexEntry, Metadata, MetadataFilter, ScoredKey, StoredChunk,
};
use context_memory_core::pii::PiiKind;
use context_memory_core::store::memory::InMemoryStore;
use context_memory_core::store::{StorageStats, Store};

/// Replies from a queue and records every request it receives.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    fn with_replies(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("script exhausted"))
    }
}

/// Hashing embedder that can be switched into a stall longer than any
/// test timeout.
struct StallingEmbedder {
    inner: HashingProvider,
    stalled: AtomicBool,
}

#[async_trait]
impl EmbeddingProvider for StallingEmbedder {
    fn provider(&self) -> &str {
        self.inner.provider()
    }
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
    fn dims(&self) -> usize {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        if self.stalled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.inner.embed(texts).await
    }
}

/// Model that answers only after `delay`.
struct SlowModel {
    delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowModel {
    fn name(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _request: &CompletionRequest) -> anyhow::Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok("too late".to_string())
    }
}

/// In-memory store whose next `get_entry`, once armed, parks after the
/// read until released.
#[derive(Default)]
struct GatedStore {
    inner: InMemoryStore,
    armed: AtomicBool,
    fetched: Notify,
    release: Notify,
}

#[async_trait]
impl Store for GatedStore {
    async fn upsert_document(&self, doc: &Document) -> anyhow::Result<String> {
        self.inner.upsert_document(doc).await
    }
    async fn replace_document_chunks(&self, doc_id: &str, keys: &[String]) -> anyhow::Result<Vec<String>> {
        self.inner.replace_document_chunks(doc_id, keys).await
    }
    async fn upsert_entry(&self, entry: &IndexEntry, dedup: bool) -> anyhow::Result<bool> {
        self.inner.upsert_entry(entry, dedup).await
    }
    async fn document_chunks_by_hash(&self, content_hash: &str) -> anyhow::Result<Vec<String>> {
        self.inner.document_chunks_by_hash(content_hash).await
    }
    async fn contains(&self, key: &str) -> anyhow::Result<bool> {
        self.inner.contains(key).await
    }
    async fn get_entry(&self, key: &str) -> anyhow::Result<Option<StoredChunk>> {
        let found = self.inner.get_entry(key).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.fetched.notify_one();
            self.release.notified().await;
        }
        found
    }
    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        limit: usize,
        filter: &MetadataFilter,
    ) -> anyhow::Result<Vec<ScoredKey>> {
        self.inner.vector_search(query_vec, model, limit, filter).await
    }
    async fn delete_entries(&self, keys: &[String]) -> anyhow::Result<usize> {
        self.inner.delete_entries(keys).await
    }
    async fn scan_entries(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<StoredChunk>> {
        self.inner.scan_entries(offset, limit).await
    }
    async fn stats(&self) -> anyhow::Result<StorageStats> {
        self.inner.stats().await
    }
}

/// One token per whitespace-separated word.
struct WordEstimator;

impl TokenEstimator for WordEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }

    fn max_chars(&self, tokens: usize) -> usize {
        tokens
    }
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::with_path(dir.join("kb.sqlite"));
    for (user, role) in [("ada", "admin"), ("eve", "editor"), ("rita", "reader")] {
        config.security.users.insert(user.to_string(), role.to_string());
    }
    config
}

fn memory_engine(
    config: Config,
    llm: Arc<dyn LanguageModel>,
) -> (MemoryEngine, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let engine = MemoryEngine::with_components(
        config,
        store.clone(),
        Arc::new(HashingProvider::new(1024)),
        llm,
    )
    .unwrap();
    (engine, store)
}

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

fn architecture_doc() -> String {
    (1..=30)
        .map(|i| {
            format!(
                "Section {i:02}. The service layer coordinates module {i:02} with storage, retries, and request validation rules."
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn meta_usize(metadata: &Metadata, key: &str) -> usize {
    metadata[key].as_u64().unwrap() as usize
}

#[tokio::test]
async fn test_ingest_large_document_and_query_service_layer() {
    let tmp = TempDir::new().unwrap();
    let (engine, store) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let text = architecture_doc();
    assert!(text.chars().count() >= 3000);
    let path = write(tmp.path(), "architecture.md", &text);

    let report = engine
        .add_document(&path, None, Some(500), Some(50), None)
        .await
        .unwrap();
    assert!(report.chunks >= 6, "got {} chunks", report.chunks);
    assert_eq!(report.added, report.chunks);

    let mut entries = store.scan_entries(0, 100).await.unwrap();
    assert_eq!(entries.len(), report.chunks);
    entries.sort_by_key(|e| meta_usize(&e.metadata, "chunk_index"));
    for entry in &entries {
        assert!(entry.text.chars().count() <= 500);
        assert_eq!(entry.metadata["source_path"], json!(path.display().to_string()));
    }
    for pair in entries.windows(2) {
        let prev_end = meta_usize(&pair[0].metadata, "char_end");
        let next_start = meta_usize(&pair[1].metadata, "char_start");
        assert!(next_start < prev_end, "consecutive chunks must overlap");
        assert!(prev_end - next_start <= 50);
    }

    let context = engine.get_context("service layer", 4, None, None).await;
    assert!(!context.is_empty());
    assert!(context.contains("service layer"));
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let path = write(tmp.path(), "notes.md", &architecture_doc());

    let first = engine.add_document(&path, None, None, None, None).await.unwrap();
    let before = engine.get_index_health().await.unwrap().storage;
    let second = engine.add_document(&path, None, None, None, None).await.unwrap();
    let after = engine.get_index_health().await.unwrap().storage;

    assert_eq!(first.document_id, second.document_id);
    assert_eq!(second.added, 0);
    assert_eq!(second.skipped, second.chunks);
    assert_eq!(before.chunks, after.chunks);
    assert_eq!(after.documents, 1);
}

#[tokio::test]
async fn test_reader_cannot_ingest() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let path = write(tmp.path(), "secret.md", "Quarterly numbers are confidential.");

    let err = engine
        .add_document(&path, None, None, None, Some("rita"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Forbidden { action: Action::Write, .. }));

    let stats = engine.get_index_health().await.unwrap().storage;
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.chunks, 0);

    let denied = engine
        .audit_log()
        .into_iter()
        .filter(|e| e.outcome == AuditOutcome::Denied)
        .count();
    assert_eq!(denied, 1);
}

#[tokio::test]
async fn test_missing_file_is_not_found() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let err = engine
        .add_document(&tmp.path().join("nope.md"), None, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_unknown_user_gets_empty_context() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let path = write(tmp.path(), "a.md", "Deploys run every Tuesday at noon.");
    engine.add_document(&path, None, None, None, None).await.unwrap();

    assert_eq!(engine.get_context("deploys", 3, Some("mallory"), None).await, "");
    assert!(engine
        .get_context_by_domains(&["deploys".to_string()], 3, Some("mallory"))
        .await
        .is_empty());
    assert!(!engine.get_context("deploys", 3, Some("rita"), None).await.is_empty());
}

#[tokio::test]
async fn test_health_on_empty_engine() {
    let tmp = TempDir::new().unwrap();
    let engine = MemoryEngine::open(test_config(tmp.path())).await.unwrap();
    let health = serde_json::to_value(engine.get_index_health().await.unwrap()).unwrap();

    for tier in ["l1", "l2"] {
        for key in ["size", "capacity", "hits", "misses", "hit_rate"] {
            assert!(health["cache"][tier].get(key).is_some(), "missing cache.{tier}.{key}");
        }
    }
    assert_eq!(health["storage"]["backend"], "sqlite");
    assert_eq!(health["storage"]["chunks"], 0);
    assert_eq!(health["storage"]["documents"], 0);
}

#[tokio::test]
async fn test_sqlite_round_trip_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = write(
        tmp.path(),
        "runbook.md",
        "The billing service retries failed charges three times before paging on-call.",
    );
    {
        let engine = MemoryEngine::open(test_config(tmp.path())).await.unwrap();
        engine.add_document(&path, None, None, None, None).await.unwrap();
    }

    let engine = MemoryEngine::open(test_config(tmp.path())).await.unwrap();
    let context = engine.get_context("billing retries", 2, None, None).await;
    assert!(context.contains("retries failed charges"));

    let health = engine.get_index_health().await.unwrap();
    assert_eq!(health.storage.documents, 1);
    assert_eq!(health.cache.l2.size, 1);
}

#[tokio::test]
async fn test_metadata_filter_restricts_results() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let a = write(tmp.path(), "a.md", "Cache eviction uses least recently used ordering.");
    let b = write(tmp.path(), "b.md", "Cache warming runs before peak traffic hours.");

    let mut team_a = Metadata::new();
    team_a.insert("team".into(), json!("storage"));
    let mut team_b = Metadata::new();
    team_b.insert("team".into(), json!("platform"));
    engine.add_document(&a, Some(team_a), None, None, None).await.unwrap();
    engine.add_document(&b, Some(team_b), None, None, None).await.unwrap();

    let mut filter = MetadataFilter::new();
    filter.insert("team".into(), json!("platform"));
    let context = engine.get_context("cache", 5, None, Some(&filter)).await;
    assert!(context.contains("warming"));
    assert!(!context.contains("eviction"));
}

#[tokio::test]
async fn test_focused_context_marker_when_nothing_found() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let topics = vec!["billing".to_string(), "auth".to_string()];
    let context = engine
        .build_focused_context(&topics, 500, 3, None, Some("task-7"), Some("planner"))
        .await;
    assert_eq!(context, "No relevant context available for topics: billing, auth");

    let zero = engine.build_focused_context(&topics, 0, 3, None, None, None).await;
    assert_eq!(zero, "No relevant context available for topics: billing, auth");
}

#[tokio::test]
async fn test_focused_context_stays_within_budget() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let path = write(tmp.path(), "arch.md", &architecture_doc());
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let topics = vec!["service layer".to_string(), "request validation".to_string()];
    let estimator = CharRatioEstimator::default();
    for budget in [40, 120, 400] {
        let context = engine
            .build_focused_context(&topics, budget, 3, None, None, None)
            .await;
        assert!(!context.is_empty());
        assert!(
            estimator.estimate(&context) <= budget,
            "budget {budget} exceeded: {} tokens",
            estimator.estimate(&context)
        );
    }
}

#[tokio::test]
async fn test_first_chunk_is_truncated_to_budget() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let long: String = (0..80)
        .map(|i| format!("ledger{i} "))
        .collect::<String>()
        .trim_end()
        .to_string();
    assert!(long.chars().count() > 80);
    let path = write(tmp.path(), "ledger.md", &long);
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let context = engine
        .build_focused_context(&["ledger0 ledger1".to_string()], 20, 3, None, None, None)
        .await;
    assert_eq!(context.chars().count(), 80);
    assert!(long.starts_with(&context));
}

#[tokio::test]
async fn test_domains_share_chunks_once() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let path = write(tmp.path(), "one.md", "Tenant isolation is enforced by schema per tenant.");
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let domains = vec!["tenant isolation".to_string(), "schema per tenant".to_string()];
    let texts = engine.get_context_by_domains(&domains, 5, None).await;
    assert_eq!(texts.len(), 1);
}

#[tokio::test]
async fn test_add_directory_is_best_effort() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let docs = tmp.path().join("docs");
    write(&docs, "good.md", "Alerts route through the pager integration.");
    write(&docs, "nested/also.md", "Dashboards refresh every minute.");
    write(&docs, "skip.txt", "Not matched by the glob.");
    fs::write(docs.join("bad.md"), [0xff, 0xfe, 0xfd]).unwrap();

    let report = engine.add_directory(&docs, "**/*.md", None, None).await.unwrap();
    assert_eq!(report.ingested.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].path.ends_with("bad.md"));

    let err = engine
        .add_directory(&tmp.path().join("absent"), "**/*", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn test_secure_delete_removes_then_reports_no_match() {
    let tmp = TempDir::new().unwrap();
    let (engine, store) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let text = "Customer export jobs write to the cold storage bucket.";
    let path = write(tmp.path(), "export.md", text);
    engine.add_document(&path, None, None, None, None).await.unwrap();

    assert!(!engine.secure_delete(text, Some("rita")).await.unwrap());
    assert_eq!(store.stats().await.unwrap().chunks, 1);

    assert!(engine.secure_delete(text, Some("eve")).await.unwrap());
    assert!(!engine.secure_delete(text, Some("eve")).await.unwrap());

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.chunks, 0);
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.tombstones, 1);
    assert_eq!(engine.get_index_health().await.unwrap().cache.l1.size, 0);
    assert_eq!(engine.get_context("cold storage", 3, None, None).await, "");
}

#[tokio::test]
async fn test_pii_scan_reports_spans_only() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let path = write(
        tmp.path(),
        "contacts.md",
        "Billing contact: pat@example.com. Card on file 4111 1111 1111 1111.",
    );
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let flags = engine.scan_for_pii(None).await;
    let kinds: Vec<PiiKind> = flags.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![PiiKind::Email, PiiKind::CreditCard]);
    let json = serde_json::to_string(&flags).unwrap();
    assert!(!json.contains("pat@example.com"));

    assert!(engine.scan_for_pii(Some("mallory")).await.is_empty());
}

#[tokio::test]
async fn test_stateless_qa_returns_result() {
    let tmp = TempDir::new().unwrap();
    let model = ScriptedModel::with_replies(&["Three times, then it pages on-call."]);
    let (engine, _) = memory_engine(test_config(tmp.path()), model.clone());
    let path = write(
        tmp.path(),
        "billing.md",
        "The billing service retries failed charges three times before paging on-call.",
    );
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let response = engine
        .retrieval_qa("How often are charges retried?", false, None, 0.2, None, None)
        .await
        .unwrap();
    let QaResponse::Stateless { result, source_keys } = &response else {
        panic!("expected a stateless response");
    };
    assert_eq!(result, "Three times, then it pages on-call.");
    assert_eq!(source_keys.len(), 1);

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].prompt.contains("retries failed charges"));
    assert!(requests[0].prompt.contains("How often are charges retried?"));
    assert_eq!(requests[0].temperature, 0.2);
    assert!(requests[0].chat_history.is_empty());
}

#[tokio::test]
async fn test_conversational_qa_condenses_and_passes_history() {
    let tmp = TempDir::new().unwrap();
    let model = ScriptedModel::with_replies(&[
        "Who is paged when billing retries are exhausted?",
        "The on-call engineer.",
    ]);
    let (engine, _) = memory_engine(test_config(tmp.path()), model.clone());
    let path = write(
        tmp.path(),
        "billing.md",
        "The billing service retries failed charges three times before paging on-call.",
    );
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let history = vec![ChatTurn::new("How often are charges retried?", "Three times.")];
    let answer = engine
        .get_answer("And then who gets paged?", true, None, 0.0, None, Some(history.clone()))
        .await
        .unwrap();
    assert_eq!(answer, "The on-call engineer.");

    let requests = model.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].prompt.contains("Follow Up Input: And then who gets paged?"));
    assert!(requests[0].prompt.contains("How often are charges retried?"));
    assert!(requests[1]
        .prompt
        .contains("Who is paged when billing retries are exhausted?"));
    assert_eq!(requests[1].chat_history, history);
}

#[tokio::test]
async fn test_conversational_response_echoes_history() {
    let tmp = TempDir::new().unwrap();
    let model = ScriptedModel::with_replies(&["standalone question", "final answer"]);
    let (engine, _) = memory_engine(test_config(tmp.path()), model);
    let history = vec![ChatTurn::new("q1", "a1"), ChatTurn::new("q2", "a2")];

    let response = engine
        .answer(QaRequest::conversational("q3", history.clone()))
        .await
        .unwrap();
    let json = serde_json::to_value(&response).unwrap();
    assert_eq!(json["answer"], "final answer");
    assert_eq!(json["chat_history"], serde_json::to_value(&history).unwrap());
    assert!(json.get("source_keys").is_some());
}

#[tokio::test]
async fn test_qa_without_model_is_retryable_error() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let err = engine
        .get_answer("anything?", false, None, 0.0, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProviderUnavailable { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_qa_denied_returns_empty_text() {
    let tmp = TempDir::new().unwrap();
    let model = ScriptedModel::with_replies(&["should not be used"]);
    let (engine, _) = memory_engine(test_config(tmp.path()), model.clone());
    let answer = engine
        .get_answer("anything?", false, None, 0.0, Some("mallory"), None)
        .await
        .unwrap();
    assert_eq!(answer, "");
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_embedding_stall_falls_back_to_cache() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.retrieval.timeout_secs = 1;
    let embedder = Arc::new(StallingEmbedder {
        inner: HashingProvider::new(128),
        stalled: AtomicBool::new(false),
    });
    let store = Arc::new(InMemoryStore::new());
    let engine = MemoryEngine::with_components(
        config,
        store.clone(),
        embedder.clone(),
        Arc::new(DisabledModel),
    )
    .unwrap();

    let path = write(tmp.path(), "limits.md", "The retry budget is ten requests per minute.");
    engine.add_document(&path, None, None, None, None).await.unwrap();

    embedder.stalled.store(true, Ordering::SeqCst);
    let context = engine.get_context("retry budget", 3, None, None).await;
    assert_eq!(context, "The retry budget is ten requests per minute.");

    let other = write(tmp.path(), "other.md", "Nothing should be written during an outage.");
    let err = engine
        .add_document(&other, None, None, None, None)
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(store.stats().await.unwrap().documents, 1);
}

#[tokio::test]
async fn test_sqlite_store_backs_engine_components() {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect(&tmp.path().join("kb.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let model = ScriptedModel::with_replies(&["Tuesdays."]);
    let engine = MemoryEngine::with_components(
        test_config(tmp.path()),
        Arc::new(SqliteStore::new(pool)),
        Arc::new(HashingProvider::new(1024)),
        model,
    )
    .unwrap();
    let path = write(tmp.path(), "deploys.md", "Production deploys happen on Tuesdays.");
    engine.add_document(&path, None, None, None, None).await.unwrap();

    let response = engine
        .answer(QaRequest::stateless("When are production deploys?").with_k(2))
        .await
        .unwrap();
    assert_eq!(response.text(), "Tuesdays.");
    assert_eq!(response.source_keys().len(), 1);

    let ops: Vec<String> = engine.profiler_stats().into_iter().map(|s| s.operation).collect();
    assert!(ops.contains(&"add_document".to_string()));
    assert!(ops.contains(&"answer".to_string()));
}

#[tokio::test]
async fn test_delete_by_text_after_window_override() {
    let tmp = TempDir::new().unwrap();
    let (engine, store) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let text = architecture_doc();
    let path = write(tmp.path(), "architecture.md", &text);
    let report = engine
        .add_document(&path, None, Some(500), Some(50), None)
        .await
        .unwrap();
    assert!(report.chunks > 1);

    assert!(engine.secure_delete(&text, Some("eve")).await.unwrap());
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.chunks, 0);
    assert_eq!(stats.documents, 0);
    assert_eq!(stats.tombstones as usize, report.chunks);
    assert!(engine.scan_for_pii(None).await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_during_hydration_is_not_recached() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.retrieval.timeout_secs = 1;
    let store = Arc::new(GatedStore::default());
    let embedder = Arc::new(StallingEmbedder {
        inner: HashingProvider::new(1024),
        stalled: AtomicBool::new(false),
    });
    let engine = Arc::new(
        MemoryEngine::with_components(config, store.clone(), embedder.clone(), Arc::new(DisabledModel))
            .unwrap(),
    );
    let text = "The retry budget is ten requests per minute.";
    let path = write(tmp.path(), "limits.md", text);
    engine.add_document(&path, None, None, None, None).await.unwrap();
    engine.clear_cache();

    store.armed.store(true, Ordering::SeqCst);
    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.get_context("retry budget", 3, None, None).await })
    };
    store.fetched.notified().await;
    assert!(engine.secure_delete(text, Some("ada")).await.unwrap());
    store.release.notify_one();

    let seen = reader.await.unwrap();
    assert_eq!(seen, "");
    let health = engine.get_index_health().await.unwrap();
    assert_eq!(health.storage.chunks, 0);
    assert_eq!(health.cache.l1.size + health.cache.l2.size, 0);

    embedder.stalled.store(true, Ordering::SeqCst);
    assert_eq!(engine.get_context("retry budget", 3, None, None).await, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_while_reading() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let engine = Arc::new(engine);
    let seed = write(tmp.path(), "seed.md", "Incident reviews happen every Friday afternoon.");
    engine.add_document(&seed, None, None, None, None).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let engine = engine.clone();
        let path = write(
            tmp.path(),
            &format!("svc{i}.md"),
            &format!("Service {i} owns queue shard{i} and its dead letter handling."),
        );
        tasks.push(tokio::spawn(async move {
            engine.add_document(&path, None, None, None, None).await.unwrap();
        }));
    }
    for _ in 0..4 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..20 {
                let context = engine.get_context("incident reviews", 3, None, None).await;
                assert!(context.contains("Friday"), "lost seed chunk: {context:?}");
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let storage = engine.get_index_health().await.unwrap().storage;
    assert_eq!(storage.documents, 9);
    assert_eq!(storage.chunks, 9);
    let context = engine.get_context("queue shard dead letter", 9, None, None).await;
    for i in 0..8 {
        assert!(context.contains(&format!("shard{i} ")), "shard{i} missing");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_write_is_visible_to_other_task() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let engine = Arc::new(engine);
    let path = write(tmp.path(), "oncall.md", "The escalation window for sev two pages is fifteen minutes.");
    let (done_tx, done_rx) = oneshot::channel();

    let writer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let report = engine.add_document(&path, None, None, None, None).await.unwrap();
            done_tx.send(report.added).unwrap();
        })
    };
    let reader = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let added = done_rx.await.unwrap();
            (added, engine.get_context("escalation window", 2, None, None).await)
        })
    };

    writer.await.unwrap();
    let (added, context) = reader.await.unwrap();
    assert_eq!(added, 1);
    assert!(context.contains("fifteen minutes"));
}

#[tokio::test]
async fn test_custom_estimator_changes_admission() {
    let tmp = TempDir::new().unwrap();
    let text = "Backups run nightly at two.";
    let path = write(tmp.path(), "backups.md", text);
    let topics = vec!["backups nightly".to_string()];

    let (chars, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    chars.add_document(&path, None, None, None, None).await.unwrap();
    let truncated = chars.build_focused_context(&topics, 6, 3, None, None, None).await;
    assert_eq!(truncated, text.chars().take(24).collect::<String>());

    let (words, _) = memory_engine(test_config(tmp.path()), Arc::new(DisabledModel));
    let words = words.with_estimator(Arc::new(WordEstimator));
    words.add_document(&path, None, None, None, None).await.unwrap();
    let whole = words.build_focused_context(&topics, 6, 3, None, None, None).await;
    assert_eq!(whole, text);
}

#[tokio::test]
async fn test_qa_request_timeout_is_honored() {
    let tmp = TempDir::new().unwrap();
    let (engine, _) = memory_engine(
        test_config(tmp.path()),
        Arc::new(SlowModel {
            delay: Duration::from_secs(30),
        }),
    );
    let started = Instant::now();
    let err = engine
        .answer(QaRequest::stateless("Who owns billing?").with_timeout(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProviderUnavailable { .. }));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(engine
        .audit_log()
        .iter()
        .any(|e| e.outcome == AuditOutcome::Failed));
}

#[tokio::test]
async fn test_qa_filter_limits_sources() {
    let tmp = TempDir::new().unwrap();
    let model = ScriptedModel::with_replies(&["Weekly."]);
    let (engine, _) = memory_engine(test_config(tmp.path()), model.clone());
    for (name, team, text) in [
        ("a.md", "storage", "Storage compaction runs weekly on Sundays."),
        ("b.md", "platform", "Platform compaction runs daily after midnight."),
    ] {
        let mut meta = Metadata::new();
        meta.insert("team".into(), json!(team));
        let path = write(tmp.path(), name, text);
        engine.add_document(&path, Some(meta), None, None, None).await.unwrap();
    }

    let mut filter = MetadataFilter::new();
    filter.insert("team".into(), json!("storage"));
    let response = engine
        .answer(QaRequest::stateless("When does compaction run?").with_filter(filter))
        .await
        .unwrap();
    assert_eq!(response.source_keys().len(), 1);
    let prompt = &model.requests()[0].prompt;
    assert!(prompt.contains("Sundays"));
    assert!(!prompt.contains("midnight"));
}
