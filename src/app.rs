//! Service bootstrapper.
//!
//! [`StoryTrim`] wires the stores, LLM provider, progressive memory, trim
//! cache, streaming orchestrator, batch engine, and both worker pools
//! together, and owns the pools' lifecycle. Callers (the CLI, or an HTTP
//! layer built on top of this crate) use it as the single entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use story_trim_core::models::{Book, Task, TaskItem, UserContext};
use story_trim_core::segment::{segment, Segmentation};
use story_trim_core::store::Stores;

use crate::batch::BatchEngine;
use crate::cache::TrimCache;
use crate::config::Config;
use crate::error::ServiceResult;
use crate::library::{BookTrimStatus, Library};
use crate::llm::{create_llm, LlmPort};
use crate::memory::ProgressiveMemory;
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::stream::{StreamTrimmer, TrimStream};
use crate::worker::WorkerPool;

pub struct StoryTrim {
    stores: Stores,
    library: Library,
    memory: Arc<ProgressiveMemory>,
    trimmer: StreamTrimmer,
    batch: BatchEngine,
    batch_pool: Arc<WorkerPool>,
    background_pool: Arc<WorkerPool>,
    rules: Vec<story_trim_core::segment::Rule>,
    shutdown_timeout: Duration,
}

impl StoryTrim {
    /// Build the service over explicit stores and provider. Starts both
    /// worker pools, so it must run inside a tokio runtime.
    pub fn new(config: &Config, stores: Stores, llm: Arc<dyn LlmPort>) -> Self {
        let workers = &config.workers;
        let batch_pool = Arc::new(WorkerPool::start(
            "batch",
            workers.batch_workers,
            workers.batch_queue,
        ));
        let background_pool = Arc::new(WorkerPool::start(
            "background",
            workers.background_workers,
            workers.background_queue,
        ));

        let memory = Arc::new(ProgressiveMemory::new(
            stores.clone(),
            llm.clone(),
            &config.memory,
        ));
        let cache = Arc::new(TrimCache::new(stores.clone(), memory.clone(), llm.clone()));
        let trimmer = StreamTrimmer::new(
            stores.clone(),
            cache.clone(),
            llm,
            background_pool.clone(),
            &config.trim,
        );
        let batch = BatchEngine::new(
            stores.clone(),
            cache,
            batch_pool.clone(),
            config.trim.chapter_concurrency,
        );
        let rules = config.segmentation.effective_rules();
        let library = Library::new(stores.clone(), rules.clone(), &config.trim);

        Self {
            stores,
            library,
            memory,
            trimmer,
            batch,
            batch_pool,
            background_pool,
            rules,
            shutdown_timeout: config.workers.shutdown_timeout(),
        }
    }

    /// Open the configured SQLite database, apply migrations, seed the
    /// built-in prompts, and build the configured LLM provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = crate::db::connect(config).await?;
        migrate::apply(&pool).await?;
        let stores = Stores::shared(Arc::new(SqliteStore::new(pool)));
        migrate::seed_prompts(stores.prompts.as_ref()).await?;
        let llm = create_llm(&config.llm)?;
        Ok(Self::new(config, stores, llm))
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn memory(&self) -> &Arc<ProgressiveMemory> {
        &self.memory
    }

    pub fn background_pool(&self) -> &WorkerPool {
        &self.background_pool
    }

    pub fn segment(&self, text: &str) -> Segmentation {
        segment(text, &self.rules)
    }

    pub async fn import_book(
        &self,
        user: UserContext,
        title: &str,
        text: &str,
    ) -> ServiceResult<Book> {
        self.library.import_book(user, title, text).await
    }

    pub async fn book_trim_status(
        &self,
        user: UserContext,
        book_id: i64,
        prompt_id: i64,
    ) -> ServiceResult<BookTrimStatus> {
        self.library.book_trim_status(user, book_id, prompt_id).await
    }

    pub async fn delete_book(&self, book_id: i64) -> ServiceResult<()> {
        self.library.delete_book(book_id).await
    }

    pub async fn stream_trim(
        &self,
        user: UserContext,
        chapter_id: i64,
        prompt_id: i64,
        cancel: CancellationToken,
    ) -> ServiceResult<TrimStream> {
        self.trimmer
            .stream_trim(user, chapter_id, prompt_id, cancel)
            .await
    }

    pub async fn stream_trim_text(
        &self,
        text: &str,
        prompt_id: i64,
        cancel: CancellationToken,
    ) -> ServiceResult<TrimStream> {
        self.trimmer.stream_trim_text(text, prompt_id, cancel).await
    }

    pub async fn submit_batch(
        &self,
        user: UserContext,
        book_id: i64,
        prompt_id: i64,
    ) -> ServiceResult<String> {
        self.batch.submit_batch(user, book_id, prompt_id).await
    }

    pub async fn get_task(&self, task_id: &str) -> ServiceResult<Task> {
        self.batch.get_task(task_id).await
    }

    pub async fn get_task_items(&self, task_id: &str) -> ServiceResult<Vec<TaskItem>> {
        self.batch.get_task_items(task_id).await
    }

    /// Stop both pools, giving running jobs up to the configured timeout.
    pub async fn shutdown(&self) {
        self.batch_pool.shutdown(self.shutdown_timeout).await;
        self.background_pool.shutdown(self.shutdown_timeout).await;
    }
}
