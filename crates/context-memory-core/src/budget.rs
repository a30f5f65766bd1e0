//! Token budgeting for context assembly.
//!
//! Token counts are estimated, not computed with a real tokenizer: the
//! default [`CharRatioEstimator`] charges one token per four characters.
//! Callers with a better estimate implement [`TokenEstimator`].

use std::collections::HashSet;

/// Separator placed between admitted chunks.
pub const SEPARATOR: &str = "\n\n";

pub trait TokenEstimator: Send + Sync {
    /// Estimated token count of `text`.
    fn estimate(&self, text: &str) -> usize;
    /// Largest character count guaranteed to fit in `tokens`.
    fn max_chars(&self, tokens: usize) -> usize;
}

#[derive(Debug, Clone, Copy)]
pub struct CharRatioEstimator {
    pub chars_per_token: usize,
}

impl Default for CharRatioEstimator {
    fn default() -> Self {
        Self { chars_per_token: 4 }
    }
}

impl TokenEstimator for CharRatioEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(self.chars_per_token.max(1))
    }

    fn max_chars(&self, tokens: usize) -> usize {
        tokens.saturating_mul(self.chars_per_token.max(1))
    }
}

/// What happened to a chunk offered to the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// First chunk, larger than the whole budget: cut to fit.
    Truncated,
    /// Already admitted under another topic, or empty.
    Skipped,
    OverBudget,
}

/// Accumulates whole chunks under a token budget.
///
/// Chunks are admitted whole or not at all, except that the first chunk
/// is truncated to the budget when it alone exceeds it, so any available
/// content always yields non-empty output.
pub struct ContextAssembler<'a> {
    estimator: &'a dyn TokenEstimator,
    max_tokens: usize,
    used_tokens: usize,
    parts: Vec<String>,
    seen: HashSet<String>,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(estimator: &'a dyn TokenEstimator, max_tokens: usize) -> Self {
        Self {
            estimator,
            max_tokens,
            used_tokens: 0,
            parts: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn offer(&mut self, chunk_key: &str, text: &str) -> Admission {
        if text.is_empty() || self.seen.contains(chunk_key) {
            return Admission::Skipped;
        }
        let separator = if self.parts.is_empty() {
            0
        } else {
            self.estimator.estimate(SEPARATOR)
        };
        let cost = self.estimator.estimate(text) + separator;
        if self.used_tokens + cost <= self.max_tokens {
            self.used_tokens += cost;
            self.parts.push(text.to_string());
            self.seen.insert(chunk_key.to_string());
            return Admission::Admitted;
        }
        if !self.parts.is_empty() || self.max_tokens == 0 {
            return Admission::OverBudget;
        }
        let cut: String = text.chars().take(self.estimator.max_chars(self.max_tokens)).collect();
        self.used_tokens = self.max_tokens;
        self.parts.push(cut);
        self.seen.insert(chunk_key.to_string());
        Admission::Truncated
    }

    /// True once no further chunk can possibly fit.
    pub fn is_full(&self) -> bool {
        self.used_tokens >= self.max_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn used_tokens(&self) -> usize {
        self.used_tokens
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn finish(self) -> String {
        self.parts.join(SEPARATOR)
    }
}

/// Deterministic marker returned when no topic produced any content.
pub fn no_context_marker(topics: &[String]) -> String {
    format!("No relevant context available for topics: {}", topics.join(", "))
}
