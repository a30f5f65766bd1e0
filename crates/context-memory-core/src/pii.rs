//! Pattern detectors for personally identifiable information.
//!
//! Flags identify where a match sits (chunk key and char span), never what
//! it matched, so a scan report is safe to log or ship elsewhere.

use regex::Regex;
use serde::Serialize;

use crate::error::{EngineError, Result};

const EMAIL_PATTERN: &str = r"(?i)\b[a-z0-9._%+-]+@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}\b";
const SSN_PATTERN: &str = r"\b(\d{3})-(\d{2})-(\d{4})\b";
const CARD_PATTERN: &str = r"\b\d(?:[ -]?\d){12,18}\b";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiKind {
    Email,
    Ssn,
    CreditCard,
}

/// A detected match. `start`/`end` are char offsets into the chunk text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PiiFlag {
    pub chunk_key: String,
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
}

/// Compiled detectors. Build once and reuse; scanning is read-only.
#[derive(Debug, Clone)]
pub struct PiiScanner {
    email: Regex,
    ssn: Regex,
    card: Regex,
}

fn compile(name: &str, pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| EngineError::validation(format!("invalid {name} pattern: {e}")))
}

impl PiiScanner {
    pub fn new() -> Result<Self> {
        Ok(Self {
            email: compile("email", EMAIL_PATTERN)?,
            ssn: compile("ssn", SSN_PATTERN)?,
            card: compile("card", CARD_PATTERN)?,
        })
    }

    /// Run every detector over one chunk. Flags are ordered by position.
    pub fn scan(&self, chunk_key: &str, text: &str) -> Vec<PiiFlag> {
        let mut spans: Vec<(PiiKind, usize, usize)> = Vec::new();

        spans.extend(self.email.find_iter(text).map(|m| (PiiKind::Email, m.start(), m.end())));

        for caps in self.ssn.captures_iter(text) {
            let (Some(whole), Some(area), Some(group), Some(serial)) =
                (caps.get(0), caps.get(1), caps.get(2), caps.get(3))
            else {
                continue;
            };
            if valid_ssn(area.as_str(), group.as_str(), serial.as_str()) {
                spans.push((PiiKind::Ssn, whole.start(), whole.end()));
            }
        }

        for m in self.card.find_iter(text) {
            let digits: Vec<u32> = m.as_str().chars().filter_map(|c| c.to_digit(10)).collect();
            if (13..=19).contains(&digits.len()) && luhn_valid(&digits) {
                spans.push((PiiKind::CreditCard, m.start(), m.end()));
            }
        }

        spans.sort_by_key(|&(kind, start, _)| (start, kind));
        spans
            .into_iter()
            .map(|(kind, start, end)| PiiFlag {
                chunk_key: chunk_key.to_string(),
                kind,
                start: text[..start].chars().count(),
                end: text[..end].chars().count(),
            })
            .collect()
    }
}

fn valid_ssn(area: &str, group: &str, serial: &str) -> bool {
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

/// Luhn checksum over digits in reading order.
pub fn luhn_valid(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    !digits.is_empty() && sum % 10 == 0
}
