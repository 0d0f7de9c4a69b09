//! Storage abstraction for Story Trim.
//!
//! Persistence is split into one narrow trait per entity family so that
//! each service only sees what it needs:
//!
//! | Trait | Entities |
//! |-------|----------|
//! | [`ContentStore`] | raw content, books, chapters |
//! | [`PromptStore`] | trim and summary prompts |
//! | [`CacheStore`] | trim results, footprints, reading progress |
//! | [`MemoryStore`] | chapter summaries, encyclopedias |
//! | [`TaskStore`] | batch tasks and their items |
//!
//! Every write is an insert-if-absent, an upsert, or an append; nothing in
//! the trimming pipeline deletes rows. The only destructive operation is
//! [`ContentStore::delete_book`].
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    Book, Chapter, ChapterSummary, ContentFingerprint, Encyclopedia, NewBook, NewChapter, Prompt,
    PromptKind, RawContent, ReadingProgress, Task, TaskItem, TrimResult, UserProcessedChapter,
};

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Insert raw text unless its fingerprint is already stored.
    ///
    /// Returns `true` when a new row was written.
    async fn save_raw_content(&self, raw: &RawContent) -> Result<bool>;

    async fn get_raw_content(&self, fp: &ContentFingerprint) -> Result<Option<RawContent>>;

    /// Create a book and all its chapters in one step.
    async fn create_book(&self, book: &NewBook, chapters: &[NewChapter]) -> Result<Book>;

    async fn get_book(&self, id: i64) -> Result<Option<Book>>;

    /// Books owned by `user_id`, or every book when `None`. Newest first.
    async fn list_books(&self, user_id: Option<i64>) -> Result<Vec<Book>>;

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>>;

    /// Chapters of a book in index order.
    async fn list_chapters(&self, book_id: i64) -> Result<Vec<Chapter>>;

    /// Remove a book, its chapters, footprints, and reading progress.
    ///
    /// Content-addressed data (raw text, trims, summaries, encyclopedias)
    /// is shared across books and stays. Returns `false` if absent.
    async fn delete_book(&self, id: i64) -> Result<bool>;
}

#[async_trait]
pub trait PromptStore: Send + Sync {
    /// Insert `prompt` unless one with the same name exists; the stored
    /// prompt is returned either way. `prompt.id` is ignored on insert.
    async fn ensure_prompt(&self, prompt: &Prompt) -> Result<Prompt>;

    async fn get_prompt(&self, id: i64) -> Result<Option<Prompt>>;

    async fn list_prompts(&self) -> Result<Vec<Prompt>>;

    /// The default prompt of a kind, falling back to the lowest id.
    async fn default_prompt(&self, kind: PromptKind) -> Result<Option<Prompt>>;
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// All cached levels for one `(fingerprint, prompt, version)`.
    async fn list_trim_results(
        &self,
        fp: &ContentFingerprint,
        prompt_id: i64,
        prompt_version: i64,
    ) -> Result<Vec<TrimResult>>;

    /// Insert or overwrite the row at `result.key()`.
    async fn upsert_trim_result(&self, result: &TrimResult) -> Result<()>;

    /// Record that a user processed a chapter. Idempotent.
    async fn record_footprint(&self, footprint: &UserProcessedChapter) -> Result<()>;

    /// Number of distinct chapters of `book_id` the user processed under `prompt_id`.
    async fn count_footprints(&self, user_id: i64, book_id: i64, prompt_id: i64) -> Result<i64>;

    async fn upsert_reading_progress(&self, progress: &ReadingProgress) -> Result<()>;

    async fn get_reading_progress(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> Result<Option<ReadingProgress>>;
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Insert or overwrite the summary at `(book_fingerprint, chapter_index)`.
    async fn upsert_summary(&self, summary: &ChapterSummary) -> Result<()>;

    /// Up to `limit` most recent summaries with index `< before_index`,
    /// returned in ascending index order.
    async fn recent_summaries(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
        limit: usize,
    ) -> Result<Vec<ChapterSummary>>;

    /// Latest encyclopedia with `range_end < before_index`.
    async fn latest_encyclopedia(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
    ) -> Result<Option<Encyclopedia>>;

    async fn get_encyclopedia(
        &self,
        book_fp: &ContentFingerprint,
        range_end: i64,
    ) -> Result<Option<Encyclopedia>>;

    /// Append a new entry. Returns `false` if `range_end` already exists.
    async fn append_encyclopedia(&self, enc: &Encyclopedia) -> Result<bool>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn update_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Insert or overwrite the item at `(task_id, chapter_id)`.
    async fn upsert_task_item(&self, item: &TaskItem) -> Result<()>;

    /// Items of a task in chapter index order.
    async fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>>;
}

/// Every store a service may need, behind shared trait objects.
#[derive(Clone)]
pub struct Stores {
    pub content: Arc<dyn ContentStore>,
    pub prompts: Arc<dyn PromptStore>,
    pub cache: Arc<dyn CacheStore>,
    pub memory: Arc<dyn MemoryStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl Stores {
    /// Use one backend for every family.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ContentStore + PromptStore + CacheStore + MemoryStore + TaskStore + 'static,
    {
        Self {
            content: store.clone(),
            prompts: store.clone(),
            cache: store.clone(),
            memory: store.clone(),
            tasks: store,
        }
    }
}
