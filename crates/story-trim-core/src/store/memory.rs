//! In-memory implementation of every store trait, for tests and embedding.
//!
//! All state lives in one `std::sync::RwLock` so multi-row writes such as
//! [`ContentStore::create_book`] are atomic. Ids are assigned from
//! per-table counters starting at 1.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::ContextLevel;
use crate::models::{
    now_ts, Book, Chapter, ChapterSummary, ContentFingerprint, Encyclopedia, NewBook, NewChapter,
    Prompt, PromptKind, RawContent, ReadingProgress, Task, TaskItem, TrimResult,
    UserProcessedChapter,
};

use super::{CacheStore, ContentStore, MemoryStore, PromptStore, TaskStore};

type TrimMapKey = (ContentFingerprint, i64, i64, ContextLevel);

#[derive(Default)]
struct State {
    next_book_id: i64,
    next_chapter_id: i64,
    next_prompt_id: i64,
    raw: HashMap<ContentFingerprint, RawContent>,
    books: BTreeMap<i64, Book>,
    chapters: BTreeMap<i64, Chapter>,
    prompts: BTreeMap<i64, Prompt>,
    trims: HashMap<TrimMapKey, TrimResult>,
    footprints: HashSet<(i64, i64, i64, i64)>,
    progress: HashMap<(i64, i64), ReadingProgress>,
    summaries: HashMap<ContentFingerprint, BTreeMap<i64, ChapterSummary>>,
    encyclopedias: HashMap<ContentFingerprint, BTreeMap<i64, Encyclopedia>>,
    tasks: HashMap<String, Task>,
    task_items: HashMap<String, BTreeMap<i64, TaskItem>>,
}

/// In-memory store for tests.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContentStore for InMemoryStore {
    async fn save_raw_content(&self, raw: &RawContent) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        if state.raw.contains_key(&raw.fingerprint) {
            return Ok(false);
        }
        state.raw.insert(raw.fingerprint.clone(), raw.clone());
        Ok(true)
    }

    async fn get_raw_content(&self, fp: &ContentFingerprint) -> Result<Option<RawContent>> {
        Ok(self.state.read().unwrap().raw.get(fp).cloned())
    }

    async fn create_book(&self, book: &NewBook, chapters: &[NewChapter]) -> Result<Book> {
        let mut state = self.state.write().unwrap();
        let now = now_ts();
        state.next_book_id += 1;
        let stored = Book {
            id: state.next_book_id,
            user_id: book.user_id,
            title: book.title.clone(),
            content_fingerprint: book.content_fingerprint.clone(),
            book_fingerprint: book.book_fingerprint.clone(),
            total_chapters: book.total_chapters,
            created_at: now,
        };
        state.books.insert(stored.id, stored.clone());
        for c in chapters {
            state.next_chapter_id += 1;
            let id = state.next_chapter_id;
            state.chapters.insert(
                id,
                Chapter {
                    id,
                    book_id: stored.id,
                    index: c.index,
                    title: c.title.clone(),
                    fingerprint: c.fingerprint.clone(),
                    created_at: now,
                },
            );
        }
        Ok(stored)
    }

    async fn get_book(&self, id: i64) -> Result<Option<Book>> {
        Ok(self.state.read().unwrap().books.get(&id).cloned())
    }

    async fn list_books(&self, user_id: Option<i64>) -> Result<Vec<Book>> {
        let state = self.state.read().unwrap();
        let mut books: Vec<Book> = state
            .books
            .values()
            .filter(|b| user_id.is_none() || b.user_id == user_id)
            .cloned()
            .collect();
        books.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(books)
    }

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>> {
        Ok(self.state.read().unwrap().chapters.get(&id).cloned())
    }

    async fn list_chapters(&self, book_id: i64) -> Result<Vec<Chapter>> {
        let state = self.state.read().unwrap();
        let mut chapters: Vec<Chapter> = state
            .chapters
            .values()
            .filter(|c| c.book_id == book_id)
            .cloned()
            .collect();
        chapters.sort_by_key(|c| c.index);
        Ok(chapters)
    }

    async fn delete_book(&self, id: i64) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        if state.books.remove(&id).is_none() {
            return Ok(false);
        }
        state.chapters.retain(|_, c| c.book_id != id);
        state.footprints.retain(|&(_, book, _, _)| book != id);
        state.progress.retain(|&(_, book), _| book != id);
        Ok(true)
    }
}

#[async_trait]
impl PromptStore for InMemoryStore {
    async fn ensure_prompt(&self, prompt: &Prompt) -> Result<Prompt> {
        let mut state = self.state.write().unwrap();
        if let Some(existing) = state.prompts.values().find(|p| p.name == prompt.name) {
            return Ok(existing.clone());
        }
        state.next_prompt_id += 1;
        let stored = Prompt {
            id: state.next_prompt_id,
            ..prompt.clone()
        };
        state.prompts.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_prompt(&self, id: i64) -> Result<Option<Prompt>> {
        Ok(self.state.read().unwrap().prompts.get(&id).cloned())
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        Ok(self.state.read().unwrap().prompts.values().cloned().collect())
    }

    async fn default_prompt(&self, kind: PromptKind) -> Result<Option<Prompt>> {
        let state = self.state.read().unwrap();
        let first = state.prompts.values().find(|p| p.kind == kind);
        let default = state
            .prompts
            .values()
            .find(|p| p.kind == kind && p.is_default);
        Ok(default.or(first).cloned())
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn list_trim_results(
        &self,
        fp: &ContentFingerprint,
        prompt_id: i64,
        prompt_version: i64,
    ) -> Result<Vec<TrimResult>> {
        let state = self.state.read().unwrap();
        let mut out: Vec<TrimResult> = state
            .trims
            .values()
            .filter(|t| &t.fingerprint == fp && t.prompt_id == prompt_id && t.prompt_version == prompt_version)
            .cloned()
            .collect();
        out.sort_by_key(|t| t.level);
        Ok(out)
    }

    async fn upsert_trim_result(&self, result: &TrimResult) -> Result<()> {
        let key = (
            result.fingerprint.clone(),
            result.prompt_id,
            result.prompt_version,
            result.level,
        );
        self.state.write().unwrap().trims.insert(key, result.clone());
        Ok(())
    }

    async fn record_footprint(&self, fp: &UserProcessedChapter) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .footprints
            .insert((fp.user_id, fp.book_id, fp.chapter_id, fp.prompt_id));
        Ok(())
    }

    async fn count_footprints(&self, user_id: i64, book_id: i64, prompt_id: i64) -> Result<i64> {
        let state = self.state.read().unwrap();
        let count = state
            .footprints
            .iter()
            .filter(|&&(u, b, _, p)| u == user_id && b == book_id && p == prompt_id)
            .count();
        Ok(count as i64)
    }

    async fn upsert_reading_progress(&self, progress: &ReadingProgress) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .progress
            .insert((progress.user_id, progress.book_id), progress.clone());
        Ok(())
    }

    async fn get_reading_progress(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> Result<Option<ReadingProgress>> {
        Ok(self
            .state
            .read()
            .unwrap()
            .progress
            .get(&(user_id, book_id))
            .cloned())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn upsert_summary(&self, summary: &ChapterSummary) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .summaries
            .entry(summary.book_fingerprint.clone())
            .or_default()
            .insert(summary.chapter_index, summary.clone());
        Ok(())
    }

    async fn recent_summaries(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
        limit: usize,
    ) -> Result<Vec<ChapterSummary>> {
        let state = self.state.read().unwrap();
        let Some(by_index) = state.summaries.get(book_fp) else {
            return Ok(Vec::new());
        };
        let mut out: Vec<ChapterSummary> = by_index
            .range(..before_index)
            .rev()
            .take(limit)
            .map(|(_, s)| s.clone())
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn latest_encyclopedia(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
    ) -> Result<Option<Encyclopedia>> {
        let state = self.state.read().unwrap();
        Ok(state
            .encyclopedias
            .get(book_fp)
            .and_then(|m| m.range(..before_index).next_back())
            .map(|(_, e)| e.clone()))
    }

    async fn get_encyclopedia(
        &self,
        book_fp: &ContentFingerprint,
        range_end: i64,
    ) -> Result<Option<Encyclopedia>> {
        let state = self.state.read().unwrap();
        Ok(state
            .encyclopedias
            .get(book_fp)
            .and_then(|m| m.get(&range_end))
            .cloned())
    }

    async fn append_encyclopedia(&self, enc: &Encyclopedia) -> Result<bool> {
        let mut state = self.state.write().unwrap();
        let entries = state
            .encyclopedias
            .entry(enc.book_fingerprint.clone())
            .or_default();
        if entries.contains_key(&enc.range_end) {
            return Ok(false);
        }
        entries.insert(enc.range_end, enc.clone());
        Ok(true)
    }
}

#[async_trait]
impl TaskStore for InMemoryStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.tasks.contains_key(&task.id) {
            anyhow::bail!("task {} already exists", task.id);
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().unwrap();
        match state.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => anyhow::bail!("task {} not found", task.id),
        }
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.state.read().unwrap().tasks.get(id).cloned())
    }

    async fn upsert_task_item(&self, item: &TaskItem) -> Result<()> {
        self.state
            .write()
            .unwrap()
            .task_items
            .entry(item.task_id.clone())
            .or_default()
            .insert(item.chapter_id, item.clone());
        Ok(())
    }

    async fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>> {
        let state = self.state.read().unwrap();
        let mut items: Vec<TaskItem> = state
            .task_items
            .get(task_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        items.sort_by_key(|i| i.chapter_index);
        Ok(items)
    }
}
