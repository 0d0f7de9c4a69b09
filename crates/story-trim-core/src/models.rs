//! Core data models used throughout Story Trim.
//!
//! These types represent the books, chapters, prompts, cached trims, and
//! progressive-memory entries that flow through the trimming pipeline.
//! Timestamps are Unix seconds, matching how the stores persist them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::ContextLevel;

/// Normalized content hash used as the content-addressed key for raw text.
///
/// Produced by [`fingerprint`](crate::fingerprint::fingerprint). Two texts
/// that differ only in whitespace, punctuation, or case share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Wrap an already computed hex digest (e.g. a value read back from a store).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Full chapter text keyed by its fingerprint. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContent {
    pub fingerprint: ContentFingerprint,
    pub text: String,
    pub char_count: i64,
    pub token_estimate: i64,
    pub created_at: i64,
}

/// An imported book. Owns an ordered sequence of [`Chapter`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub user_id: Option<i64>,
    pub title: String,
    /// Fingerprint of the whole uploaded text.
    pub content_fingerprint: ContentFingerprint,
    /// Fingerprint of the first chapter; scopes progressive memory across
    /// re-uploads of the same book by different users.
    pub book_fingerprint: ContentFingerprint,
    pub total_chapters: i64,
    pub created_at: i64,
}

/// Fields needed to create a book; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewBook {
    pub user_id: Option<i64>,
    pub title: String,
    pub content_fingerprint: ContentFingerprint,
    pub book_fingerprint: ContentFingerprint,
    pub total_chapters: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub book_id: i64,
    pub index: i64,
    pub title: String,
    pub fingerprint: ContentFingerprint,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct NewChapter {
    pub index: i64,
    pub title: String,
    pub fingerprint: ContentFingerprint,
}

/// What a prompt is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    Trim,
    Summary,
}

impl PromptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptKind::Trim => "trim",
            PromptKind::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trim" => Some(PromptKind::Trim),
            "summary" => Some(PromptKind::Summary),
            _ => None,
        }
    }
}

/// A named trim configuration.
///
/// `version` is part of every trim cache key, so editing a prompt's
/// instructions (and bumping its version) never reuses stale trims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub kind: PromptKind,
    pub version: i64,
    /// Free-form instructions appended to the fixed policy text.
    pub template: String,
    pub target_ratio_min: f64,
    pub target_ratio_max: f64,
    /// Hard length window; falls back to the target ratios when absent.
    pub boundary_ratio_min: Option<f64>,
    pub boundary_ratio_max: Option<f64>,
    pub is_default: bool,
    pub is_system: bool,
}

impl Prompt {
    pub fn boundary_min(&self) -> f64 {
        self.boundary_ratio_min.unwrap_or(self.target_ratio_min)
    }

    pub fn boundary_max(&self) -> f64 {
        self.boundary_ratio_max.unwrap_or(self.target_ratio_max)
    }
}

/// Short synopsis of one chapter, scoped by book fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub book_fingerprint: ContentFingerprint,
    pub chapter_index: i64,
    pub chapter_fingerprint: ContentFingerprint,
    pub content: String,
    pub created_at: i64,
}

/// Merged setting document covering chapters `[0, range_end]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Encyclopedia {
    pub book_fingerprint: ContentFingerprint,
    pub range_end: i64,
    pub content: String,
    pub created_at: i64,
}

/// Cache key for a trim result. Higher context levels coexist with lower ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrimKey {
    pub fingerprint: ContentFingerprint,
    pub prompt_id: i64,
    pub prompt_version: i64,
    pub level: ContextLevel,
}

/// A memoized trim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimResult {
    pub fingerprint: ContentFingerprint,
    pub prompt_id: i64,
    pub prompt_version: i64,
    pub level: ContextLevel,
    pub trimmed_text: String,
    pub trimmed_chars: i64,
    pub ratio: f64,
    pub tokens_consumed: i64,
    pub latency_ms: i64,
    pub created_at: i64,
}

impl TrimResult {
    pub fn key(&self) -> TrimKey {
        TrimKey {
            fingerprint: self.fingerprint.clone(),
            prompt_id: self.prompt_id,
            prompt_version: self.prompt_version,
            level: self.level,
        }
    }
}

/// Records that a user processed a chapter under a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProcessedChapter {
    pub user_id: i64,
    pub book_id: i64,
    pub chapter_id: i64,
    pub prompt_id: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingProgress {
    pub user_id: i64,
    pub book_id: i64,
    pub last_chapter_id: i64,
    pub last_prompt_id: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Header row of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: Option<i64>,
    pub book_id: i64,
    pub prompt_id: i64,
    pub kind: String,
    pub status: TaskStatus,
    pub progress: i64,
    pub error: Option<String>,
    pub elapsed_ms: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    /// A fresh `pending` full-book trim task with a random UUID.
    pub fn new_full_trim(user_id: Option<i64>, book_id: i64, prompt_id: i64, now: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id,
            book_id,
            prompt_id,
            kind: "full_trim".to_string(),
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
            elapsed_ms: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskItemStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl TaskItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskItemStatus::Pending => "pending",
            TaskItemStatus::Processing => "processing",
            TaskItemStatus::Done => "done",
            TaskItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskItemStatus::Pending),
            "processing" => Some(TaskItemStatus::Processing),
            "done" => Some(TaskItemStatus::Done),
            "failed" => Some(TaskItemStatus::Failed),
            _ => None,
        }
    }
}

/// Per-chapter status row of a batch job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub task_id: String,
    pub chapter_id: i64,
    pub chapter_index: i64,
    pub status: TaskItemStatus,
    pub error: Option<String>,
    pub updated_at: i64,
}

/// Caller identity. Anonymous callers (`user_id == None`) are fully
/// supported; per-user writes are skipped for them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: Option<i64>,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self { user_id: None }
    }

    pub fn user(id: i64) -> Self {
        // Zero is the anonymous id in upstream auth layers.
        Self {
            user_id: (id > 0).then_some(id),
        }
    }
}

/// Current Unix time in seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
