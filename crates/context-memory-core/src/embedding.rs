//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the offline [`HashingProvider`], and pure helper functions for
//! vector serialization and similarity computation.
//!
//! HTTP providers (OpenAI, Ollama) live in the `context-memory` app crate.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Trait for embedding providers.
///
/// Calls may block on network I/O; the engine wraps every call in a
/// timeout and treats failure as a recoverable provider outage.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider family (e.g. `"openai"`, `"hash"`).
    fn provider(&self) -> &str;
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;

    /// Tag stored with every vector. Search only compares vectors that
    /// share a tag, so swapping models never mixes incompatible spaces.
    fn version_tag(&self) -> String {
        format!("{}:{}@{}", self.provider(), self.model_name(), self.dims())
    }

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Deterministic feature-hashing embedder.
///
/// Lowercased word unigrams and adjacent-word bigrams are hashed (SHA-256,
/// so vectors are stable across builds and restarts) into `dims` signed
/// buckets, then L2-normalised. Texts that share vocabulary and phrases land
/// close together under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dims: usize,
}

impl HashingProvider {
    pub const MODEL: &'static str = "bow-v1";

    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens = tokenize(text);
        let mut vec = vec![0.0f32; self.dims];
        for token in &tokens {
            self.accumulate(&mut vec, token, 1.0);
        }
        for pair in tokens.windows(2) {
            self.accumulate(&mut vec, &format!("{} {}", pair[0], pair[1]), 0.5);
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for v in &mut vec {
                *v /= norm;
            }
        }
        vec
    }

    fn accumulate(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let bucket = u64::from_le_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
        ]) % self.dims as u64;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vec[bucket as usize] += sign * weight;
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn provider(&self) -> &str {
        "hash"
    }
    fn model_name(&self) -> &str {
        Self::MODEL
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

/// Lowercase alphanumeric word tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use context_memory_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns `0.0` for empty vectors or vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
