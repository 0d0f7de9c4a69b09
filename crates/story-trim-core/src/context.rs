//! Context levels and the quality-tiered cache lookup rule.
//!
//! A trim produced while the model could see prior-chapter memory is
//! better than one produced blind. The [`ContextLevel`] records how much
//! memory was available when a trim was generated:
//!
//! | Level | Summaries | Encyclopedia |
//! |-------|-----------|--------------|
//! | `None` (0) | 0 | absent |
//! | `Partial` (1) | `1..limit`, or `>= limit` without encyclopedia | any |
//! | `Full` (2) | `>= limit` | present |
//!
//! Cached trims at a lower level than what is currently computable are
//! stale and get regenerated; the old rows stay in place.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{ChapterSummary, Encyclopedia, TrimResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ContextLevel {
    None = 0,
    Partial = 1,
    Full = 2,
}

impl ContextLevel {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(ContextLevel::None),
            1 => Some(ContextLevel::Partial),
            2 => Some(ContextLevel::Full),
            _ => None,
        }
    }

    /// Level reachable with `summary_count` summaries and an optional
    /// encyclopedia, given the configured summary limit.
    pub fn compute(summary_count: usize, has_encyclopedia: bool, summary_limit: usize) -> Self {
        if summary_count == 0 && !has_encyclopedia {
            ContextLevel::None
        } else if summary_count >= summary_limit && has_encyclopedia {
            ContextLevel::Full
        } else {
            ContextLevel::Partial
        }
    }
}

impl From<ContextLevel> for i64 {
    fn from(level: ContextLevel) -> i64 {
        level.as_i64()
    }
}

impl TryFrom<i64> for ContextLevel {
    type Error = String;

    fn try_from(v: i64) -> Result<Self, Self::Error> {
        ContextLevel::from_i64(v).ok_or_else(|| format!("invalid context level {v}"))
    }
}

impl fmt::Display for ContextLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// Prior-chapter memory visible to a trim of one chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    /// Most recent summaries before the chapter, ascending by index.
    pub summaries: Vec<ChapterSummary>,
    pub encyclopedia: Option<Encyclopedia>,
}

impl MemoryContext {
    pub fn level(&self, summary_limit: usize) -> ContextLevel {
        ContextLevel::compute(
            self.summaries.len(),
            self.encyclopedia.is_some(),
            summary_limit,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty() && self.encyclopedia.is_none()
    }
}

/// Pick the entry to serve for `current`: the highest cached level, as long
/// as it is at least `current`. `None` means every cached entry is stale.
///
/// `entries` must all share one `(fingerprint, prompt, version)`.
pub fn select_authoritative(entries: &[TrimResult], current: ContextLevel) -> Option<&TrimResult> {
    entries
        .iter()
        .filter(|e| e.level >= current)
        .max_by_key(|e| e.level)
}
