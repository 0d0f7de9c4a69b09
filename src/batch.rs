//! Whole-book batch trimming.
//!
//! [`BatchEngine::submit_batch`] validates the request, writes a `pending`
//! task, and hands a [`BatchJob`] to the batch [`WorkerPool`]. The job:
//!
//! 1. Marks the task `running` and writes one `pending` item per chapter.
//! 2. Skips chapters whose cached trim is already good enough for the
//!    context level reachable now (footprint only, item `done`).
//! 3. Spawns the rest as independent units bounded by a semaphore of
//!    `chapter_concurrency` permits. A failing unit never affects others.
//! 4. Aggregates completions in a single `JoinSet` loop: persists progress
//!    whenever the integer percentage grows and, every
//!    `encyclopedia_interval` completions, awaits a rollup at the highest
//!    chapter index completed so far.
//! 5. Ends `failed` if every chapter failed, otherwise `completed` with one
//!    error line per failed chapter.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use story_trim_core::fingerprint::is_blank;
use story_trim_core::models::{
    now_ts, Book, Chapter, Prompt, PromptKind, Task, TaskItem, TaskItemStatus, TaskStatus,
    UserContext,
};
use story_trim_core::store::Stores;

use crate::cache::TrimCache;
use crate::error::{ServiceResult, TrimError};
use crate::worker::{Job, WorkerPool};

/// Error recorded on a task whose job never made it into the queue.
pub const QUEUE_FULL_ERROR: &str = "dropped: worker queue full";

pub struct BatchEngine {
    stores: Stores,
    cache: Arc<TrimCache>,
    pool: Arc<WorkerPool>,
    chapter_concurrency: usize,
}

impl BatchEngine {
    pub fn new(
        stores: Stores,
        cache: Arc<TrimCache>,
        pool: Arc<WorkerPool>,
        chapter_concurrency: usize,
    ) -> Self {
        Self {
            stores,
            cache,
            pool,
            chapter_concurrency: chapter_concurrency.max(1),
        }
    }

    /// Queue a full-book trim. Returns the task id.
    ///
    /// A full queue is not an error: the task is recorded as `failed` with
    /// [`QUEUE_FULL_ERROR`] and its id is still returned.
    pub async fn submit_batch(
        &self,
        user: UserContext,
        book_id: i64,
        prompt_id: i64,
    ) -> ServiceResult<String> {
        let book = self
            .stores
            .content
            .get_book(book_id)
            .await?
            .ok_or_else(|| TrimError::not_found("book", book_id))?;
        let prompt = self
            .stores
            .prompts
            .get_prompt(prompt_id)
            .await?
            .ok_or_else(|| TrimError::not_found("prompt", prompt_id))?;
        if prompt.kind != PromptKind::Trim {
            return Err(TrimError::InvalidInput(format!(
                "prompt {} is not a trim prompt",
                prompt_id
            )));
        }
        let chapters = self.stores.content.list_chapters(book_id).await?;
        if chapters.is_empty() {
            return Err(TrimError::InvalidInput(format!("book {} has no chapters", book_id)));
        }

        let mut task = Task::new_full_trim(user.user_id, book_id, prompt_id, now_ts());
        self.stores.tasks.create_task(&task).await?;
        let task_id = task.id.clone();

        let job = BatchJob {
            stores: self.stores.clone(),
            cache: self.cache.clone(),
            task: task.clone(),
            user,
            book,
            chapters,
            prompt,
            concurrency: self.chapter_concurrency,
        };

        if self.pool.try_submit(Box::new(job)) {
            tracing::info!(task_id = %task_id, book_id, prompt_id, "batch trim queued");
        } else {
            task.status = TaskStatus::Failed;
            task.error = Some(QUEUE_FULL_ERROR.to_string());
            task.updated_at = now_ts();
            self.stores.tasks.update_task(&task).await?;
        }

        Ok(task_id)
    }

    pub async fn get_task(&self, task_id: &str) -> ServiceResult<Task> {
        self.stores
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| TrimError::not_found("task", task_id))
    }

    pub async fn get_task_items(&self, task_id: &str) -> ServiceResult<Vec<TaskItem>> {
        self.get_task(task_id).await?;
        Ok(self.stores.tasks.list_task_items(task_id).await?)
    }
}

pub struct BatchJob {
    stores: Stores,
    cache: Arc<TrimCache>,
    task: Task,
    user: UserContext,
    book: Book,
    chapters: Vec<Chapter>,
    prompt: Prompt,
    concurrency: usize,
}

type UnitOutcome = (Chapter, Result<(), TrimError>);

impl BatchJob {
    fn item(&self, chapter: &Chapter, status: TaskItemStatus, error: Option<String>) -> TaskItem {
        TaskItem {
            task_id: self.task.id.clone(),
            chapter_id: chapter.id,
            chapter_index: chapter.index,
            status,
            error,
            updated_at: now_ts(),
        }
    }

    async fn save_task(&mut self) -> anyhow::Result<()> {
        self.task.updated_at = now_ts();
        self.stores.tasks.update_task(&self.task).await
    }

    async fn execute(&mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        let started = Instant::now();
        self.task.status = TaskStatus::Running;
        self.save_task().await?;

        for chapter in &self.chapters {
            self.stores
                .tasks
                .upsert_task_item(&self.item(chapter, TaskItemStatus::Pending, None))
                .await?;
        }

        let total = self.chapters.len();
        let mut done = 0usize;
        let mut failures: Vec<String> = Vec::new();
        let mut todo: Vec<Chapter> = Vec::new();

        for chapter in &self.chapters {
            // Blank chapters have nothing to trim and count as done.
            if is_blank(&chapter.fingerprint) {
                self.stores
                    .tasks
                    .upsert_task_item(&self.item(chapter, TaskItemStatus::Done, None))
                    .await?;
                done += 1;
                continue;
            }
            let resolution = self.cache.resolve(&self.book, chapter, &self.prompt).await?;
            if resolution.cached.is_some() {
                self.cache
                    .record_footprint(self.user, self.book.id, chapter.id, self.prompt.id)
                    .await?;
                self.stores
                    .tasks
                    .upsert_task_item(&self.item(chapter, TaskItemStatus::Done, None))
                    .await?;
                done += 1;
            } else {
                todo.push(chapter.clone());
            }
        }
        tracing::info!(
            task_id = %self.task.id,
            book_id = self.book.id,
            total,
            skipped = done,
            "batch trim running"
        );
        self.report_progress(done, total).await?;

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut units: JoinSet<UnitOutcome> = JoinSet::new();
        for chapter in todo {
            units.spawn(run_unit(
                self.stores.clone(),
                self.cache.clone(),
                semaphore.clone(),
                self.task.id.clone(),
                self.user,
                self.book.clone(),
                chapter,
                self.prompt.clone(),
                cancel.clone(),
            ));
        }

        let interval = self.cache.memory().encyclopedia_interval();
        let mut unit_completions = 0usize;
        let mut highest_done: Option<i64> = None;

        while let Some(joined) = units.join_next().await {
            unit_completions += 1;
            done += 1;

            match joined {
                Ok((chapter, Ok(()))) => {
                    highest_done = highest_done.max(Some(chapter.index));
                    self.stores
                        .tasks
                        .upsert_task_item(&self.item(&chapter, TaskItemStatus::Done, None))
                        .await?;
                }
                Ok((chapter, Err(e))) => {
                    tracing::warn!(task_id = %self.task.id, chapter_index = chapter.index, error = %e, "chapter trim failed");
                    failures.push(format!("chapter {} ({}): {}", chapter.index, chapter.title, e));
                    self.stores
                        .tasks
                        .upsert_task_item(&self.item(&chapter, TaskItemStatus::Failed, Some(e.to_string())))
                        .await?;
                }
                Err(e) => {
                    tracing::error!(task_id = %self.task.id, error = %e, "chapter unit aborted");
                    failures.push(format!("unit aborted: {}", e));
                }
            }

            self.report_progress(done, total).await?;

            if unit_completions % interval == 0 {
                if let Some(end) = highest_done {
                    if let Err(e) = self
                        .cache
                        .memory()
                        .rollup(&self.book.book_fingerprint, end, cancel.clone())
                        .await
                    {
                        tracing::warn!(task_id = %self.task.id, range_end = end, error = %e, "encyclopedia rollup failed");
                    }
                }
            }
        }

        self.task.status = if failures.len() == total {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
        self.task.progress = 100;
        self.task.error = (!failures.is_empty()).then(|| failures.join("\n"));
        self.task.elapsed_ms = Some(started.elapsed().as_millis() as i64);
        self.save_task().await?;

        tracing::info!(
            task_id = %self.task.id,
            status = self.task.status.as_str(),
            failed = failures.len(),
            total,
            elapsed_ms = self.task.elapsed_ms.unwrap_or_default(),
            "batch trim finished"
        );
        Ok(())
    }

    /// Persist progress when the integer percentage grew.
    async fn report_progress(&mut self, done: usize, total: usize) -> anyhow::Result<()> {
        let pct = if total == 0 { 100 } else { (done * 100 / total) as i64 };
        if pct > self.task.progress {
            self.task.progress = pct;
            self.save_task().await?;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_unit(
    stores: Stores,
    cache: Arc<TrimCache>,
    semaphore: Arc<Semaphore>,
    task_id: String,
    user: UserContext,
    book: Book,
    chapter: Chapter,
    prompt: Prompt,
    cancel: CancellationToken,
) -> UnitOutcome {
    let permit = tokio::select! {
        _ = cancel.cancelled() => None,
        permit = semaphore.acquire_owned() => permit.ok(),
    };
    let Some(_permit) = permit else {
        return (chapter, Err(TrimError::Cancelled));
    };

    let processing = TaskItem {
        task_id,
        chapter_id: chapter.id,
        chapter_index: chapter.index,
        status: TaskItemStatus::Processing,
        error: None,
        updated_at: now_ts(),
    };
    if let Err(e) = stores.tasks.upsert_task_item(&processing).await {
        return (chapter, Err(e.into()));
    }

    let work = cache.get_or_compute(user, &book, &chapter, &prompt, cancel);
    let outcome = match AssertUnwindSafe(work).catch_unwind().await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TrimError::Llm("chapter trim panicked".to_string())),
    };
    (chapter, outcome)
}

#[async_trait]
impl Job for BatchJob {
    fn name(&self) -> &'static str {
        "full_trim"
    }

    async fn run(mut self: Box<Self>, cancel: CancellationToken) -> anyhow::Result<()> {
        if let Err(e) = self.execute(cancel).await {
            tracing::error!(task_id = %self.task.id, error = %e, "batch trim aborted");
            self.task.status = TaskStatus::Failed;
            self.task.error = Some(e.to_string());
            self.save_task().await?;
        }
        Ok(())
    }
}
