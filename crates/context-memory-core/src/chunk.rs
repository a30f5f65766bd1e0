//! Size-bounded, overlapping text chunker.
//!
//! Splits document text into [`Chunk`]s whose length (in characters, not
//! bytes) never exceeds `max_chunk_size`. Consecutive chunks share up to
//! `overlap` characters so that sentences straddling a cut remain
//! retrievable from either side.
//!
//! Every chunk is keyed by [`fingerprint`] of its normalized text, which makes
//! the key a content address: identical content yields the same key across
//! documents, re-ingestion, and restarts.
//!
//! # Algorithm
//!
//! 1. Resolve the effective window (adaptive mode balances windows so the
//!    last chunk is not a sliver).
//! 2. Produce character spans:
//!    - **Fixed** mode slides the window with stride `window - overlap`,
//!      cutting at the last whitespace in the window's final fifth.
//!    - **Semantic** mode splits on blank-line paragraphs, then on sentence
//!      bounds for oversized paragraphs, then packs units greedily. Each new
//!      chunk starts `overlap` characters before the previous one ended.
//! 3. Merge fragments shorter than `min_chunk_size` into their predecessor
//!    when the result still fits the window.
//! 4. Trim, fingerprint, optionally score and drop degenerate chunks, and
//!    collapse duplicate fingerprints.
//!
//! # Example
//!
//! ```rust
//! use context_memory_core::chunk::{split, ChunkingConfig};
//!
//! let chunks = split("Hello world.\n\nSecond paragraph.", &ChunkingConfig::default());
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{EngineError, Result};
use crate::models::{Chunk, Metadata};

/// Chunking policy.
///
/// Deserializes from the `[chunking]` config section; every field has a
/// default so partial sections are valid.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Split on paragraph/sentence boundaries before packing.
    pub semantic: bool,
    /// Balance window sizes across the document.
    pub adaptive: bool,
    pub min_chunk_size: usize,
    pub max_chunk_size: usize,
    /// Overlap between consecutive chunks as a percentage of the window.
    pub overlap_percent: usize,
    /// Collapse chunks with identical fingerprints.
    pub dedup: bool,
    /// Score chunks and drop degenerate ones.
    pub quality_metrics: bool,
    /// Minimum quality score kept when `quality_metrics` is on.
    pub quality_threshold: f64,
    /// Absolute overlap in characters; overrides `overlap_percent`.
    #[serde(skip)]
    pub overlap_chars: Option<usize>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            semantic: true,
            adaptive: false,
            min_chunk_size: 100,
            max_chunk_size: 1000,
            overlap_percent: 10,
            dedup: true,
            quality_metrics: false,
            quality_threshold: 0.2,
            overlap_chars: None,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(EngineError::validation("chunking.max_chunk_size must be > 0"));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(EngineError::validation(format!(
                "chunking.min_chunk_size ({}) must not exceed max_chunk_size ({})",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.overlap_percent >= 100 {
            return Err(EngineError::validation(
                "chunking.overlap_percent must be < 100",
            ));
        }
        if let Some(overlap) = self.overlap_chars {
            if overlap >= self.max_chunk_size {
                return Err(EngineError::validation(format!(
                    "chunk overlap ({}) must be smaller than chunk size ({})",
                    overlap, self.max_chunk_size
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(EngineError::validation(
                "chunking.quality_threshold must be in [0.0, 1.0]",
            ));
        }
        Ok(())
    }

    /// Apply per-call overrides of window size and absolute overlap.
    ///
    /// A window smaller than `min_chunk_size` lowers the minimum to match.
    pub fn with_window(&self, chunk_size: Option<usize>, chunk_overlap: Option<usize>) -> Result<Self> {
        let mut cfg = self.clone();
        if let Some(size) = chunk_size {
            cfg.max_chunk_size = size;
            cfg.min_chunk_size = cfg.min_chunk_size.min(size);
        }
        if let Some(overlap) = chunk_overlap {
            cfg.overlap_chars = Some(overlap);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Overlap in characters for the configured window.
    pub fn overlap(&self) -> usize {
        let overlap = self
            .overlap_chars
            .unwrap_or(self.max_chunk_size * self.overlap_percent / 100);
        overlap.min(self.max_chunk_size.saturating_sub(1))
    }
}

/// Deterministic content fingerprint used as `chunk_key`.
///
/// Normalization trims the text and collapses every whitespace run to a
/// single space, so formatting-only differences map to the same key.
pub fn fingerprint(text: &str) -> String {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Returns true if `s` has the shape of a fingerprint (64 lowercase hex chars).
pub fn looks_like_key(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Split `text` into chunks according to `config`.
///
/// # Guarantees
///
/// - At least one chunk is always returned (empty input yields one empty chunk).
/// - Input shorter than `min_chunk_size` yields exactly one chunk.
/// - Every chunk has at most `max_chunk_size` characters.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
pub fn split(text: &str, config: &ChunkingConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();

    if text.trim().is_empty() {
        return vec![make_chunk(0, "", 0, 0, None)];
    }

    let overlap = config.overlap();
    let window = effective_window(n, config, overlap);

    let mut spans = if config.semantic {
        semantic_spans(text, &chars, window, overlap)
    } else {
        fixed_spans(&chars, 0, n, window, overlap)
    };
    merge_short_fragments(&mut spans, config.min_chunk_size, window);

    let mut drafts: Vec<(String, usize, usize)> = spans
        .into_iter()
        .filter_map(|(start, end)| trim_span(&chars, start, end))
        .map(|(start, end)| (chars[start..end].iter().collect(), start, end))
        .collect();

    if drafts.is_empty() {
        drafts.push((text.trim().to_string(), 0, n));
    }

    let mut scored: Vec<(String, usize, usize, Option<f64>)> = drafts
        .into_iter()
        .map(|(t, s, e)| {
            let q = config.quality_metrics.then(|| quality_score(&t));
            (t, s, e, q)
        })
        .collect();

    if config.quality_metrics {
        let best = scored
            .iter()
            .enumerate()
            .max_by(|a, b| a.1 .3.partial_cmp(&b.1 .3).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut kept = Vec::with_capacity(scored.len());
        for (i, draft) in scored.into_iter().enumerate() {
            if draft.3.unwrap_or(1.0) >= config.quality_threshold || i == best {
                kept.push(draft);
            }
        }
        if kept.len() > 1 {
            kept.retain(|d| d.3.unwrap_or(1.0) >= config.quality_threshold);
        }
        scored = kept;
    }

    let mut seen = HashSet::new();
    let mut chunks = Vec::with_capacity(scored.len());
    for (text, start, end, quality) in scored {
        let chunk = make_chunk(chunks.len(), &text, start, end, quality);
        if config.dedup && !seen.insert(chunk.chunk_key.clone()) {
            continue;
        }
        chunks.push(chunk);
    }
    chunks
}

/// Informativeness in `[0, 1]`: distinct-word ratio weighted by the share of
/// alphanumeric characters among non-whitespace characters.
pub fn quality_score(text: &str) -> f64 {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let distinct: HashSet<&String> = words.iter().collect();
    let distinct_ratio = distinct.len() as f64 / words.len() as f64;

    let visible: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    let alnum = visible.iter().filter(|c| c.is_alphanumeric()).count();
    let density = alnum as f64 / visible.len().max(1) as f64;

    distinct_ratio * density
}

fn effective_window(n: usize, config: &ChunkingConfig, overlap: usize) -> usize {
    let max = config.max_chunk_size;
    if !config.adaptive || n <= max {
        return max;
    }
    let stride = max - overlap;
    let pieces = (n - overlap).div_ceil(stride);
    let balanced = (n - overlap).div_ceil(pieces) + overlap;
    balanced.clamp(config.min_chunk_size.max(overlap + 1), max)
}

/// Slide a `window` over `chars[from..to]` with stride `window - overlap`.
fn fixed_spans(chars: &[char], from: usize, to: usize, window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut pos = from;
    while pos < to {
        let hard_end = (pos + window).min(to);
        let end = if hard_end < to {
            let floor = pos + window * 4 / 5;
            (floor..hard_end)
                .rev()
                .find(|&i| chars[i].is_whitespace())
                .filter(|&i| i > pos)
                .unwrap_or(hard_end)
        } else {
            hard_end
        };
        spans.push((pos, end));
        if end >= to {
            break;
        }
        let next = end.saturating_sub(overlap);
        pos = if next > pos { next } else { end };
    }
    spans
}

/// Paragraph/sentence-aware packing.
fn semantic_spans(text: &str, chars: &[char], window: usize, overlap: usize) -> Vec<(usize, usize)> {
    let byte_to_char = byte_to_char_map(text);
    let piece = window.saturating_sub(overlap).max(1);

    let mut units: Vec<(usize, usize)> = Vec::new();
    for (p_start, p_end) in paragraph_spans(chars) {
        if p_end - p_start <= window {
            units.push((p_start, p_end));
            continue;
        }
        let paragraph_bytes = (char_to_byte(text, p_start), char_to_byte(text, p_end));
        let paragraph = &text[paragraph_bytes.0..paragraph_bytes.1];
        for (offset, sentence) in paragraph.split_sentence_bound_indices() {
            let s_start = byte_to_char[paragraph_bytes.0 + offset];
            let s_end = byte_to_char[paragraph_bytes.0 + offset + sentence.len()];
            let Some((s_start, s_end)) = trim_span(chars, s_start, s_end) else {
                continue;
            };
            if s_end - s_start <= piece {
                units.push((s_start, s_end));
            } else {
                units.extend(fixed_spans(chars, s_start, s_end, piece, 0));
            }
        }
    }

    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (u_start, u_end) in units {
        current = match current {
            None => Some((u_start, u_end)),
            Some((c_start, c_end)) if u_end - c_start <= window => Some((c_start, u_end.max(c_end))),
            Some((c_start, c_end)) => {
                spans.push((c_start, c_end));
                let seeded = c_end
                    .saturating_sub(overlap)
                    .max(u_end.saturating_sub(window))
                    .min(u_start);
                Some((seeded, u_end))
            }
        };
    }
    if let Some(span) = current {
        spans.push(span);
    }
    spans
}

/// Blank-line separated paragraphs, trimmed, as char spans.
fn paragraph_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\n' {
            let mut j = i + 1;
            while j < chars.len() && chars[j] != '\n' && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && chars[j] == '\n' {
                if let Some(span) = trim_span(chars, start, i) {
                    spans.push(span);
                }
                start = j + 1;
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    if let Some(span) = trim_span(chars, start, chars.len()) {
        spans.push(span);
    }
    spans
}

fn merge_short_fragments(spans: &mut Vec<(usize, usize)>, min: usize, window: usize) {
    let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
    for &(start, end) in spans.iter() {
        if let Some(prev) = merged.last_mut() {
            if end - start < min && end - prev.0 <= window {
                prev.1 = prev.1.max(end);
                continue;
            }
        }
        merged.push((start, end));
    }
    *spans = merged;
}

fn trim_span(chars: &[char], mut start: usize, mut end: usize) -> Option<(usize, usize)> {
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start < end).then_some((start, end))
}

fn byte_to_char_map(text: &str) -> Vec<usize> {
    let mut map = vec![0; text.len() + 1];
    let mut char_idx = 0;
    for (byte_idx, c) in text.char_indices() {
        for b in 0..c.len_utf8() {
            map[byte_idx + b] = char_idx;
        }
        char_idx += 1;
    }
    map[text.len()] = char_idx;
    map
}

fn char_to_byte(text: &str, char_idx: usize) -> usize {
    text.char_indices()
        .nth(char_idx)
        .map(|(b, _)| b)
        .unwrap_or(text.len())
}

fn make_chunk(index: usize, text: &str, start: usize, end: usize, quality: Option<f64>) -> Chunk {
    let mut metadata = Metadata::new();
    metadata.insert("chunk_index".into(), json!(index));
    metadata.insert("char_start".into(), json!(start));
    metadata.insert("char_end".into(), json!(end));
    if let Some(q) = quality {
        metadata.insert("quality".into(), json!(q));
    }
    Chunk {
        chunk_key: fingerprint(text),
        chunk_index: index,
        text: text.to_string(),
        metadata,
    }
}
