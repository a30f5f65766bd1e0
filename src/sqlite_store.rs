//! SQLite-backed [`Store`] implementation.
//!
//! One database file holds the vector index (`chunks`), the document store
//! (`documents` + `document_chunks`), and deletion tombstones. Similarity
//! search is brute-force cosine over the vectors of the requested model,
//! after metadata filtering.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use context_memory_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use context_memory_core::models::{
    matches_filter, Document, IndexEntry, Metadata, MetadataFilter, ScoredKey, StoredChunk,
};
use context_memory_core::store::{rank, StorageStats, Store};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_metadata(json: &str) -> Result<Metadata> {
    serde_json::from_str(json).context("corrupt metadata_json")
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<StoredChunk> {
    let metadata_json: String = row.get("metadata_json");
    Ok(StoredChunk {
        chunk_key: row.get("chunk_key"),
        text: row.get("text"),
        metadata: parse_metadata(&metadata_json)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<String> {
        let existing: Option<String> =
            sqlx::query_scalar("SELECT id FROM documents WHERE source_path = ?")
                .bind(&doc.source_path)
                .fetch_optional(&self.pool)
                .await?;
        let doc_id = existing.unwrap_or_else(|| doc.id.clone());

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_path, metadata_json, content_hash, ingested_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source_path) DO UPDATE SET
                metadata_json = excluded.metadata_json,
                content_hash = excluded.content_hash,
                ingested_at = excluded.ingested_at
            "#,
        )
        .bind(&doc_id)
        .bind(&doc.source_path)
        .bind(serde_json::to_string(&doc.metadata)?)
        .bind(&doc.content_hash)
        .bind(doc.ingested_at)
        .execute(&self.pool)
        .await?;

        Ok(doc_id)
    }

    async fn replace_document_chunks(&self, doc_id: &str, keys: &[String]) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;

        let previous: Vec<String> =
            sqlx::query_scalar("SELECT chunk_key FROM document_chunks WHERE document_id = ?")
                .bind(doc_id)
                .fetch_all(&mut *tx)
                .await?;

        sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        for (position, key) in keys.iter().enumerate() {
            sqlx::query(
                "INSERT INTO document_chunks (document_id, position, chunk_key) VALUES (?, ?, ?)",
            )
            .bind(doc_id)
            .bind(position as i64)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }

        let mut purged = Vec::new();
        for key in previous {
            if keys.contains(&key) || purged.contains(&key) {
                continue;
            }
            let refs: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE chunk_key = ?")
                    .bind(&key)
                    .fetch_one(&mut *tx)
                    .await?;
            if refs > 0 {
                continue;
            }
            let removed = sqlx::query("DELETE FROM chunks WHERE chunk_key = ?")
                .bind(&key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if removed > 0 {
                purged.push(key);
            }
        }

        tx.commit().await?;
        Ok(purged)
    }

    async fn upsert_entry(&self, entry: &IndexEntry, dedup: bool) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM tombstones WHERE chunk_key = ?")
            .bind(&entry.chunk_key)
            .execute(&mut *tx)
            .await?;

        let existed: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chunks WHERE chunk_key = ?")
                .bind(&entry.chunk_key)
                .fetch_one(&mut *tx)
                .await?;

        if !(existed && dedup) {
            sqlx::query(
                r#"
                INSERT INTO chunks (chunk_key, text, metadata_json, embedding, model, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(chunk_key) DO UPDATE SET
                    text = excluded.text,
                    metadata_json = excluded.metadata_json,
                    embedding = excluded.embedding,
                    model = excluded.model
                "#,
            )
            .bind(&entry.chunk_key)
            .bind(&entry.text)
            .bind(serde_json::to_string(&entry.metadata)?)
            .bind(vec_to_blob(&entry.vector))
            .bind(&entry.model)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(!existed)
    }

    async fn document_chunks_by_hash(&self, content_hash: &str) -> Result<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT dc.chunk_key
            FROM document_chunks dc
            JOIN documents d ON d.id = dc.document_id
            WHERE d.content_hash = ?
            ORDER BY d.id, dc.position
            "#,
        )
        .bind(content_hash)
        .fetch_all(&self.pool)
        .await?;

        let mut keys: Vec<String> = Vec::with_capacity(rows.len());
        for key in rows {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let found: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM chunks WHERE chunk_key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(found)
    }

    async fn get_entry(&self, key: &str) -> Result<Option<StoredChunk>> {
        let row = sqlx::query("SELECT chunk_key, text, metadata_json FROM chunks WHERE chunk_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_chunk).transpose()
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        limit: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredKey>> {
        let rows = sqlx::query("SELECT chunk_key, metadata_json, embedding FROM chunks WHERE model = ?")
            .bind(model)
            .fetch_all(&self.pool)
            .await?;

        let mut scored = Vec::with_capacity(rows.len());
        for row in &rows {
            if !filter.is_empty() {
                let metadata_json: String = row.get("metadata_json");
                if !matches_filter(&parse_metadata(&metadata_json)?, filter) {
                    continue;
                }
            }
            let blob: Vec<u8> = row.get("embedding");
            scored.push(ScoredKey {
                chunk_key: row.get("chunk_key"),
                score: cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64,
            });
        }
        Ok(rank(scored, limit))
    }

    async fn delete_entries(&self, keys: &[String]) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut removed = 0usize;
        let mut touched_docs: Vec<String> = Vec::new();

        for key in keys {
            let docs: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT document_id FROM document_chunks WHERE chunk_key = ?",
            )
            .bind(key)
            .fetch_all(&mut *tx)
            .await?;
            touched_docs.extend(docs);

            sqlx::query("DELETE FROM document_chunks WHERE chunk_key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;

            let deleted = sqlx::query("DELETE FROM chunks WHERE chunk_key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            if deleted > 0 {
                removed += 1;
                sqlx::query(
                    "INSERT INTO tombstones (chunk_key, deleted_at) VALUES (?, ?)
                     ON CONFLICT(chunk_key) DO UPDATE SET deleted_at = excluded.deleted_at",
                )
                .bind(key)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        touched_docs.sort();
        touched_docs.dedup();
        for doc_id in &touched_docs {
            sqlx::query(
                "DELETE FROM documents WHERE id = ?
                 AND NOT EXISTS (SELECT 1 FROM document_chunks WHERE document_id = ?)",
            )
            .bind(doc_id)
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        if removed > 0 {
            // Push the deleted pages out of the WAL into the zeroed main file.
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await?;
        }
        Ok(removed)
    }

    async fn scan_entries(&self, offset: usize, limit: usize) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            "SELECT chunk_key, text, metadata_json FROM chunks ORDER BY chunk_key LIMIT ? OFFSET ?",
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn stats(&self) -> Result<StorageStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE length(embedding) > 0")
            .fetch_one(&self.pool)
            .await?;
        let tombstones: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tombstones")
            .fetch_one(&self.pool)
            .await?;
        let models: Vec<String> = sqlx::query_scalar("SELECT DISTINCT model FROM chunks ORDER BY model")
            .fetch_all(&self.pool)
            .await?;
        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await?;

        Ok(StorageStats {
            backend: "sqlite".to_string(),
            documents: documents as u64,
            chunks: chunks as u64,
            embedded: embedded as u64,
            tombstones: tombstones as u64,
            models,
            size_bytes: Some((page_count * page_size) as u64),
        })
    }
}
