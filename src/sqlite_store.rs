//! SQLite-backed implementation of the store traits.
//!
//! Maps each trait method to plain `sqlx::query` statements against the
//! schema created by [`migrate::apply`](crate::migrate::apply). Writes are
//! `INSERT ... ON CONFLICT` upserts or insert-if-absent; multi-row writes
//! run inside a transaction.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use story_trim_core::context::ContextLevel;
use story_trim_core::models::{
    now_ts, Book, Chapter, ChapterSummary, ContentFingerprint, Encyclopedia, NewBook, NewChapter,
    Prompt, PromptKind, RawContent, ReadingProgress, Task, TaskItem, TaskItemStatus, TaskStatus,
    TrimResult, UserProcessedChapter,
};
use story_trim_core::store::{CacheStore, ContentStore, MemoryStore, PromptStore, TaskStore};

/// SQLite implementation of every store trait.
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

const BOOK_COLUMNS: &str =
    "id, user_id, title, content_fingerprint, book_fingerprint, total_chapters, created_at";
const CHAPTER_COLUMNS: &str = "id, book_id, chapter_index, title, fingerprint, created_at";
const PROMPT_COLUMNS: &str = "id, name, description, kind, version, template, target_ratio_min, \
    target_ratio_max, boundary_ratio_min, boundary_ratio_max, is_default, is_system";
const TRIM_COLUMNS: &str = "fingerprint, prompt_id, prompt_version, level, trimmed_text, \
    trimmed_chars, ratio, tokens_consumed, latency_ms, created_at";
const TASK_COLUMNS: &str = "id, user_id, book_id, prompt_id, kind, status, progress, error, \
    elapsed_ms, created_at, updated_at";

fn fp(row: &SqliteRow, column: &str) -> ContentFingerprint {
    ContentFingerprint::from_hex(row.get::<String, _>(column))
}

fn row_to_book(row: &SqliteRow) -> Book {
    Book {
        id: row.get("id"),
        user_id: row.get("user_id"),
        title: row.get("title"),
        content_fingerprint: fp(row, "content_fingerprint"),
        book_fingerprint: fp(row, "book_fingerprint"),
        total_chapters: row.get("total_chapters"),
        created_at: row.get("created_at"),
    }
}

fn row_to_chapter(row: &SqliteRow) -> Chapter {
    Chapter {
        id: row.get("id"),
        book_id: row.get("book_id"),
        index: row.get("chapter_index"),
        title: row.get("title"),
        fingerprint: fp(row, "fingerprint"),
        created_at: row.get("created_at"),
    }
}

fn row_to_prompt(row: &SqliteRow) -> Result<Prompt> {
    let kind: String = row.get("kind");
    Ok(Prompt {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        kind: PromptKind::parse(&kind).ok_or_else(|| anyhow!("unknown prompt kind '{}'", kind))?,
        version: row.get("version"),
        template: row.get("template"),
        target_ratio_min: row.get("target_ratio_min"),
        target_ratio_max: row.get("target_ratio_max"),
        boundary_ratio_min: row.get("boundary_ratio_min"),
        boundary_ratio_max: row.get("boundary_ratio_max"),
        is_default: row.get("is_default"),
        is_system: row.get("is_system"),
    })
}

fn row_to_trim(row: &SqliteRow) -> Result<TrimResult> {
    let level: i64 = row.get("level");
    Ok(TrimResult {
        fingerprint: fp(row, "fingerprint"),
        prompt_id: row.get("prompt_id"),
        prompt_version: row.get("prompt_version"),
        level: ContextLevel::from_i64(level)
            .ok_or_else(|| anyhow!("invalid context level {} in trim_results", level))?,
        trimmed_text: row.get("trimmed_text"),
        trimmed_chars: row.get("trimmed_chars"),
        ratio: row.get("ratio"),
        tokens_consumed: row.get("tokens_consumed"),
        latency_ms: row.get("latency_ms"),
        created_at: row.get("created_at"),
    })
}

fn row_to_summary(row: &SqliteRow) -> ChapterSummary {
    ChapterSummary {
        book_fingerprint: fp(row, "book_fingerprint"),
        chapter_index: row.get("chapter_index"),
        chapter_fingerprint: fp(row, "chapter_fingerprint"),
        content: row.get("content"),
        created_at: row.get("created_at"),
    }
}

fn row_to_encyclopedia(row: &SqliteRow) -> Encyclopedia {
    Encyclopedia {
        book_fingerprint: fp(row, "book_fingerprint"),
        range_end: row.get("range_end"),
        content: row.get("content"),
        created_at: row.get("created_at"),
    }
}

fn row_to_task(row: &SqliteRow) -> Result<Task> {
    let status: String = row.get("status");
    Ok(Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        book_id: row.get("book_id"),
        prompt_id: row.get("prompt_id"),
        kind: row.get("kind"),
        status: TaskStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown task status '{}'", status))?,
        progress: row.get("progress"),
        error: row.get("error"),
        elapsed_ms: row.get("elapsed_ms"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_task_item(row: &SqliteRow) -> Result<TaskItem> {
    let status: String = row.get("status");
    Ok(TaskItem {
        task_id: row.get("task_id"),
        chapter_id: row.get("chapter_id"),
        chapter_index: row.get("chapter_index"),
        status: TaskItemStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown task item status '{}'", status))?,
        error: row.get("error"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl ContentStore for SqliteStore {
    async fn save_raw_content(&self, raw: &RawContent) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO raw_contents (fingerprint, text, char_count, token_estimate, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
        )
        .bind(raw.fingerprint.as_str())
        .bind(&raw.text)
        .bind(raw.char_count)
        .bind(raw.token_estimate)
        .bind(raw.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_raw_content(&self, fp: &ContentFingerprint) -> Result<Option<RawContent>> {
        let row = sqlx::query(
            "SELECT fingerprint, text, char_count, token_estimate, created_at FROM raw_contents WHERE fingerprint = ?",
        )
        .bind(fp.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| RawContent {
            fingerprint: ContentFingerprint::from_hex(r.get::<String, _>("fingerprint")),
            text: r.get("text"),
            char_count: r.get("char_count"),
            token_estimate: r.get("token_estimate"),
            created_at: r.get("created_at"),
        }))
    }

    async fn create_book(&self, book: &NewBook, chapters: &[NewChapter]) -> Result<Book> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO books (user_id, title, content_fingerprint, book_fingerprint, total_chapters, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(book.user_id)
        .bind(&book.title)
        .bind(book.content_fingerprint.as_str())
        .bind(book.book_fingerprint.as_str())
        .bind(book.total_chapters)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let book_id = result.last_insert_rowid();

        for chapter in chapters {
            sqlx::query(
                "INSERT INTO chapters (book_id, chapter_index, title, fingerprint, created_at) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(book_id)
            .bind(chapter.index)
            .bind(&chapter.title)
            .bind(chapter.fingerprint.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Book {
            id: book_id,
            user_id: book.user_id,
            title: book.title.clone(),
            content_fingerprint: book.content_fingerprint.clone(),
            book_fingerprint: book.book_fingerprint.clone(),
            total_chapters: book.total_chapters,
            created_at: now,
        })
    }

    async fn get_book(&self, id: i64) -> Result<Option<Book>> {
        let row = sqlx::query(&format!("SELECT {BOOK_COLUMNS} FROM books WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_book))
    }

    async fn list_books(&self, user_id: Option<i64>) -> Result<Vec<Book>> {
        let rows = match user_id {
            Some(uid) => {
                sqlx::query(&format!(
                    "SELECT {BOOK_COLUMNS} FROM books WHERE user_id = ? ORDER BY created_at DESC, id DESC"
                ))
                .bind(uid)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {BOOK_COLUMNS} FROM books ORDER BY created_at DESC, id DESC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(row_to_book).collect())
    }

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>> {
        let row = sqlx::query(&format!("SELECT {CHAPTER_COLUMNS} FROM chapters WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_chapter))
    }

    async fn list_chapters(&self, book_id: i64) -> Result<Vec<Chapter>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHAPTER_COLUMNS} FROM chapters WHERE book_id = ? ORDER BY chapter_index ASC"
        ))
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chapter).collect())
    }

    async fn delete_book(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        for sql in [
            "DELETE FROM user_processed_chapters WHERE book_id = ?",
            "DELETE FROM reading_progress WHERE book_id = ?",
            "DELETE FROM chapters WHERE book_id = ?",
        ] {
            sqlx::query(sql).bind(id).execute(&mut *tx).await?;
        }
        let result = sqlx::query("DELETE FROM books WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl PromptStore for SqliteStore {
    async fn ensure_prompt(&self, prompt: &Prompt) -> Result<Prompt> {
        sqlx::query(
            r#"
            INSERT INTO prompts (name, description, kind, version, template,
                                 target_ratio_min, target_ratio_max,
                                 boundary_ratio_min, boundary_ratio_max,
                                 is_default, is_system)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&prompt.name)
        .bind(&prompt.description)
        .bind(prompt.kind.as_str())
        .bind(prompt.version)
        .bind(&prompt.template)
        .bind(prompt.target_ratio_min)
        .bind(prompt.target_ratio_max)
        .bind(prompt.boundary_ratio_min)
        .bind(prompt.boundary_ratio_max)
        .bind(prompt.is_default)
        .bind(prompt.is_system)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE name = ?"))
            .bind(&prompt.name)
            .fetch_one(&self.pool)
            .await?;
        row_to_prompt(&row)
    }

    async fn get_prompt(&self, id: i64) -> Result<Option<Prompt>> {
        let row = sqlx::query(&format!("SELECT {PROMPT_COLUMNS} FROM prompts WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_prompt).transpose()
    }

    async fn list_prompts(&self) -> Result<Vec<Prompt>> {
        let rows = sqlx::query(&format!("SELECT {PROMPT_COLUMNS} FROM prompts ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_prompt).collect()
    }

    async fn default_prompt(&self, kind: PromptKind) -> Result<Option<Prompt>> {
        let row = sqlx::query(&format!(
            "SELECT {PROMPT_COLUMNS} FROM prompts WHERE kind = ? ORDER BY is_default DESC, id ASC LIMIT 1"
        ))
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_prompt).transpose()
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn list_trim_results(
        &self,
        fp: &ContentFingerprint,
        prompt_id: i64,
        prompt_version: i64,
    ) -> Result<Vec<TrimResult>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIM_COLUMNS} FROM trim_results WHERE fingerprint = ? AND prompt_id = ? AND prompt_version = ? ORDER BY level ASC"
        ))
        .bind(fp.as_str())
        .bind(prompt_id)
        .bind(prompt_version)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_trim).collect()
    }

    async fn upsert_trim_result(&self, result: &TrimResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trim_results (fingerprint, prompt_id, prompt_version, level, trimmed_text,
                                      trimmed_chars, ratio, tokens_consumed, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(fingerprint, prompt_id, prompt_version, level) DO UPDATE SET
                trimmed_text = excluded.trimmed_text,
                trimmed_chars = excluded.trimmed_chars,
                ratio = excluded.ratio,
                tokens_consumed = excluded.tokens_consumed,
                latency_ms = excluded.latency_ms,
                created_at = excluded.created_at
            "#,
        )
        .bind(result.fingerprint.as_str())
        .bind(result.prompt_id)
        .bind(result.prompt_version)
        .bind(result.level.as_i64())
        .bind(&result.trimmed_text)
        .bind(result.trimmed_chars)
        .bind(result.ratio)
        .bind(result.tokens_consumed)
        .bind(result.latency_ms)
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_footprint(&self, footprint: &UserProcessedChapter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_processed_chapters (user_id, book_id, chapter_id, prompt_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, book_id, chapter_id, prompt_id) DO NOTHING
            "#,
        )
        .bind(footprint.user_id)
        .bind(footprint.book_id)
        .bind(footprint.chapter_id)
        .bind(footprint.prompt_id)
        .bind(footprint.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_footprints(&self, user_id: i64, book_id: i64, prompt_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_processed_chapters WHERE user_id = ? AND book_id = ? AND prompt_id = ?",
        )
        .bind(user_id)
        .bind(book_id)
        .bind(prompt_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn upsert_reading_progress(&self, progress: &ReadingProgress) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reading_progress (user_id, book_id, last_chapter_id, last_prompt_id, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, book_id) DO UPDATE SET
                last_chapter_id = excluded.last_chapter_id,
                last_prompt_id = excluded.last_prompt_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(progress.user_id)
        .bind(progress.book_id)
        .bind(progress.last_chapter_id)
        .bind(progress.last_prompt_id)
        .bind(progress.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_reading_progress(
        &self,
        user_id: i64,
        book_id: i64,
    ) -> Result<Option<ReadingProgress>> {
        let row = sqlx::query(
            "SELECT user_id, book_id, last_chapter_id, last_prompt_id, updated_at FROM reading_progress WHERE user_id = ? AND book_id = ?",
        )
        .bind(user_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| ReadingProgress {
            user_id: r.get("user_id"),
            book_id: r.get("book_id"),
            last_chapter_id: r.get("last_chapter_id"),
            last_prompt_id: r.get("last_prompt_id"),
            updated_at: r.get("updated_at"),
        }))
    }
}

#[async_trait]
impl MemoryStore for SqliteStore {
    async fn upsert_summary(&self, summary: &ChapterSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chapter_summaries (book_fingerprint, chapter_index, chapter_fingerprint, content, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(book_fingerprint, chapter_index) DO UPDATE SET
                chapter_fingerprint = excluded.chapter_fingerprint,
                content = excluded.content,
                created_at = excluded.created_at
            "#,
        )
        .bind(summary.book_fingerprint.as_str())
        .bind(summary.chapter_index)
        .bind(summary.chapter_fingerprint.as_str())
        .bind(&summary.content)
        .bind(summary.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_summaries(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
        limit: usize,
    ) -> Result<Vec<ChapterSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT book_fingerprint, chapter_index, chapter_fingerprint, content, created_at
            FROM chapter_summaries
            WHERE book_fingerprint = ? AND chapter_index < ?
            ORDER BY chapter_index DESC
            LIMIT ?
            "#,
        )
        .bind(book_fp.as_str())
        .bind(before_index)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<ChapterSummary> = rows.iter().map(row_to_summary).collect();
        out.reverse();
        Ok(out)
    }

    async fn latest_encyclopedia(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
    ) -> Result<Option<Encyclopedia>> {
        let row = sqlx::query(
            r#"
            SELECT book_fingerprint, range_end, content, created_at
            FROM encyclopedias
            WHERE book_fingerprint = ? AND range_end < ?
            ORDER BY range_end DESC
            LIMIT 1
            "#,
        )
        .bind(book_fp.as_str())
        .bind(before_index)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_encyclopedia))
    }

    async fn get_encyclopedia(
        &self,
        book_fp: &ContentFingerprint,
        range_end: i64,
    ) -> Result<Option<Encyclopedia>> {
        let row = sqlx::query(
            "SELECT book_fingerprint, range_end, content, created_at FROM encyclopedias WHERE book_fingerprint = ? AND range_end = ?",
        )
        .bind(book_fp.as_str())
        .bind(range_end)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_encyclopedia))
    }

    async fn append_encyclopedia(&self, enc: &Encyclopedia) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO encyclopedias (book_fingerprint, range_end, content, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(book_fingerprint, range_end) DO NOTHING
            "#,
        )
        .bind(enc.book_fingerprint.as_str())
        .bind(enc.range_end)
        .bind(&enc.content)
        .bind(enc.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&task.id)
        .bind(task.user_id)
        .bind(task.book_id)
        .bind(task.prompt_id)
        .bind(&task.kind)
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.error)
        .bind(task.elapsed_ms)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?, progress = ?, error = ?, elapsed_ms = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.progress)
        .bind(&task.error)
        .bind(task.elapsed_ms)
        .bind(task.updated_at)
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("task {} not found", task.id);
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn upsert_task_item(&self, item: &TaskItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO task_items (task_id, chapter_id, chapter_index, status, error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(task_id, chapter_id) DO UPDATE SET
                chapter_index = excluded.chapter_index,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item.task_id)
        .bind(item.chapter_id)
        .bind(item.chapter_index)
        .bind(item.status.as_str())
        .bind(&item.error)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_task_items(&self, task_id: &str) -> Result<Vec<TaskItem>> {
        let rows = sqlx::query(
            "SELECT task_id, chapter_id, chapter_index, status, error, updated_at FROM task_items WHERE task_id = ? ORDER BY chapter_index ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_task_item).collect()
    }
}
