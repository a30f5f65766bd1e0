//! Two-tier (hot L1 / warm L2) LRU cache in front of the durable store.
//!
//! Each tier is an [`lru::LruCache`] behind its own `parking_lot::RwLock`.
//! Lookups only take the read lock and `peek`; the recency bump is applied
//! with `try_write`, so concurrent readers never wait on each other and LRU
//! order is eventually consistent under contention.
//!
//! # Flow
//!
//! ```text
//! get(key) ──▶ L1 hit ──────────────────────────────▶ chunk
//!          └─▶ L2 hit ── hits ≥ promote_after ─▶ move to L1
//!          └─▶ miss ──▶ caller loads from store ──▶ admit() into L2
//!
//! put(chunk) ──▶ L1 ── evicted ──▶ L2 ── evicted ──▶ dropped
//! ```
//!
//! # Eviction epoch
//!
//! [`remove`](TieredCache::remove) and [`clear`](TieredCache::clear) bump an
//! epoch while holding both tier locks. A reader that loads from the store
//! snapshots [`epoch`](TieredCache::epoch) first and hands it to `admit`,
//! which refuses the chunk if any eviction ran in between. A chunk fetched
//! just before a secure delete therefore cannot be written back.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::embedding::tokenize;
use crate::error::{EngineError, Result};
use crate::models::{matches_filter, MetadataFilter, RetrievedChunk, StoredChunk};

/// Tier sizing from the `[cache]` config section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub l1_capacity: usize,
    pub l2_capacity: usize,
    /// L2 hits after which an entry moves to L1.
    pub promote_after: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_capacity: 128,
            l2_capacity: 1024,
            promote_after: 2,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.l1_capacity == 0 || self.l2_capacity == 0 {
            return Err(EngineError::validation("cache capacities must be > 0"));
        }
        if self.promote_after == 0 {
            return Err(EngineError::validation("cache.promote_after must be >= 1"));
        }
        Ok(())
    }
}

/// Health of a single tier.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TierHealth {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Health of both tiers.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheHealth {
    pub l1: TierHealth,
    pub l2: TierHealth,
}

type Entries = LruCache<String, Slot>;

struct Slot {
    chunk: StoredChunk,
    hits: AtomicU32,
}

impl Slot {
    fn new(chunk: StoredChunk) -> Self {
        Self {
            chunk,
            hits: AtomicU32::new(0),
        }
    }
}

struct Tier {
    entries: RwLock<Entries>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Tier {
    fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn touch(&self, key: &str) {
        if let Some(mut entries) = self.entries.try_write() {
            entries.promote(key);
        }
    }

    fn health(&self) -> TierHealth {
        let entries = self.entries.read();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        TierHealth {
            size: entries.len(),
            capacity: entries.cap().get(),
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}

/// The tiered cache.
pub struct TieredCache {
    l1: Tier,
    l2: Tier,
    promote_after: u32,
    epoch: AtomicU64,
}

impl TieredCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            l1: Tier::new(config.l1_capacity),
            l2: Tier::new(config.l2_capacity),
            promote_after: config.promote_after.max(1),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current eviction epoch. Snapshot it before a store read whose
    /// result will be passed to [`admit`](Self::admit).
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Look a key up in L1, then L2. `None` means the caller must fall
    /// through to the store and [`admit`](Self::admit) the result.
    pub fn get(&self, key: &str) -> Option<StoredChunk> {
        let hot = self.l1.entries.read().peek(key).map(|slot| slot.chunk.clone());
        if let Some(chunk) = hot {
            self.l1.hits.fetch_add(1, Ordering::Relaxed);
            self.l1.touch(key);
            return Some(chunk);
        }
        self.l1.misses.fetch_add(1, Ordering::Relaxed);

        let warm = self
            .l2
            .entries
            .read()
            .peek(key)
            .map(|slot| (slot.chunk.clone(), slot.hits.fetch_add(1, Ordering::Relaxed) + 1));
        match warm {
            Some((chunk, hits)) => {
                self.l2.hits.fetch_add(1, Ordering::Relaxed);
                if hits >= self.promote_after {
                    let mut l1 = self.l1.entries.write();
                    let mut l2 = self.l2.entries.write();
                    // Gone if a remove ran since the peek.
                    if let Some(slot) = l2.pop(key) {
                        insert_hot(&mut l1, &mut l2, slot.chunk);
                    }
                } else {
                    self.l2.touch(key);
                }
                Some(chunk)
            }
            None => {
                self.l2.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Write-through insert into L1. The L1 victim, if any, is demoted to L2.
    pub fn put(&self, chunk: StoredChunk) {
        let mut l1 = self.l1.entries.write();
        let mut l2 = self.l2.entries.write();
        insert_hot(&mut l1, &mut l2, chunk);
    }

    /// Insert a chunk loaded from the store after a miss into L2.
    ///
    /// `seen_epoch` is the [`epoch`](Self::epoch) observed before the store
    /// read. Returns false, caching nothing, when an eviction has run since.
    pub fn admit(&self, chunk: StoredChunk, seen_epoch: u64) -> bool {
        let l1 = self.l1.entries.read();
        let mut l2 = self.l2.entries.write();
        if self.epoch.load(Ordering::Acquire) != seen_epoch {
            return false;
        }
        if !l1.contains(&chunk.chunk_key) {
            l2.push(chunk.chunk_key.clone(), Slot::new(chunk));
        }
        true
    }

    /// Remove keys from both tiers. Returns how many cached entries were dropped.
    pub fn remove(&self, keys: &[String]) -> usize {
        let mut l1 = self.l1.entries.write();
        let mut l2 = self.l2.entries.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        keys.iter()
            .map(|k| usize::from(l1.pop(k).is_some()) + usize::from(l2.pop(k).is_some()))
            .sum()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.l1.entries.read().contains(key) || self.l2.entries.read().contains(key)
    }

    /// Empty both tiers. Hit/miss counters are kept.
    pub fn clear(&self) {
        let mut l1 = self.l1.entries.write();
        let mut l2 = self.l2.entries.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        l1.clear();
        l2.clear();
    }

    pub fn health(&self) -> CacheHealth {
        CacheHealth {
            l1: self.l1.health(),
            l2: self.l2.health(),
        }
    }

    /// Keyword search over cached entries only.
    ///
    /// Used when the embedding provider is unavailable. Scores are the
    /// fraction of query tokens present in the chunk, plus a bonus when
    /// the whole query appears verbatim.
    pub fn search_text(&self, query: &str, limit: usize, filter: &MetadataFilter) -> Vec<RetrievedChunk> {
        let terms = tokenize(query);
        if terms.is_empty() {
            return Vec::new();
        }
        let phrase = terms.join(" ");

        let mut candidates: Vec<StoredChunk> = Vec::new();
        for tier in [&self.l1, &self.l2] {
            let entries = tier.entries.read();
            candidates.extend(
                entries
                    .iter()
                    .filter(|(_, slot)| matches_filter(&slot.chunk.metadata, filter))
                    .map(|(_, slot)| slot.chunk.clone()),
            );
        }

        let mut scored: Vec<RetrievedChunk> = candidates
            .into_iter()
            .filter_map(|chunk| {
                let tokens = tokenize(&chunk.text);
                let matched = terms.iter().filter(|t| tokens.contains(t)).count();
                if matched == 0 {
                    return None;
                }
                let mut score = matched as f64 / terms.len() as f64;
                if tokens.join(" ").contains(&phrase) {
                    score += 1.0;
                }
                Some(RetrievedChunk {
                    chunk_key: chunk.chunk_key,
                    text: chunk.text,
                    metadata: chunk.metadata,
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_key.cmp(&b.chunk_key))
        });
        scored.dedup_by(|a, b| a.chunk_key == b.chunk_key);
        scored.truncate(limit);
        scored
    }
}

/// Push into L1, demoting the L1 victim to L2. Both tier locks are held
/// by the caller, L1 first.
fn insert_hot(l1: &mut Entries, l2: &mut Entries, chunk: StoredChunk) {
    let key = chunk.chunk_key.clone();
    l2.pop(&key);
    if let Some((victim_key, victim)) = l1.push(key.clone(), Slot::new(chunk)) {
        if victim_key != key {
            l2.push(victim_key, Slot::new(victim.chunk));
        }
    }
}
