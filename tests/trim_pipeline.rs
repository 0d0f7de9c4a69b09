//! End-to-end tests of the trimming pipeline over the in-memory store.
//!
//! A scripted model stands in for the provider so each test controls
//! exactly what the stream and structured calls return.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use story_trim::app::StoryTrim;
use story_trim::batch::QUEUE_FULL_ERROR;
use story_trim::config::Config;
use story_trim::error::TrimError;
use story_trim::llm::{ChatStream, LlmPort, StructuredReply};
use story_trim::migrate;
use story_trim::stream::StreamSource;
use story_trim_core::context::ContextLevel;
use story_trim_core::fingerprint::{fingerprint, is_blank};
use story_trim_core::models::{
    Book, Chapter, ChapterSummary, Encyclopedia, Task, TaskItemStatus, TaskStatus, UserContext,
};
use story_trim_core::prompt::ENCYCLOPEDIA_POLICY;
use story_trim_core::store::memory::InMemoryStore;
use story_trim_core::store::Stores;

// ─── Scripted model ─────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq)]
enum StreamMode {
    /// Three increments, then a clean end.
    Chunks,
    /// The first increment is an error.
    FailFirst,
    /// One increment, then an error.
    FailMidway,
    /// Increments until cancelled.
    Endless,
    /// One increment, then nothing until cancelled. The channel then
    /// closes without an error, as a real provider does.
    StallAfterFirst,
}

const STREAMED: &str = "Trimmed chapter text.";

struct ScriptedLlm {
    mode: Mutex<StreamMode>,
    stream_calls: AtomicUsize,
    structured_calls: AtomicUsize,
    chat_calls: AtomicUsize,
    upstream_cancelled: Arc<AtomicBool>,
    /// Structured calls on text containing `HOLD` wait for a permit here.
    gate: Semaphore,
}

impl ScriptedLlm {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(StreamMode::Chunks),
            stream_calls: AtomicUsize::new(0),
            structured_calls: AtomicUsize::new(0),
            chat_calls: AtomicUsize::new(0),
            upstream_cancelled: Arc::new(AtomicBool::new(false)),
            gate: Semaphore::new(0),
        })
    }

    fn set_mode(&self, mode: StreamMode) {
        *self.mode.lock().unwrap() = mode;
    }
}

#[async_trait]
impl LlmPort for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(
        &self,
        _system: &str,
        _user: &str,
        cancel: CancellationToken,
    ) -> Result<ChatStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        let (tx, rx) = mpsc::channel(8);
        let cancelled = self.upstream_cancelled.clone();

        tokio::spawn(async move {
            match mode {
                StreamMode::Chunks => {
                    for piece in ["Trimmed ", "chapter ", "text."] {
                        if tx.send(Ok(piece.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                StreamMode::FailFirst => {
                    let _ = tx.send(Err(anyhow!("401 unauthorized"))).await;
                }
                StreamMode::FailMidway => {
                    let _ = tx.send(Ok("Trimmed ".to_string())).await;
                    let _ = tx.send(Err(anyhow!("connection reset"))).await;
                }
                StreamMode::Endless => loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            cancelled.store(true, Ordering::SeqCst);
                            return;
                        }
                        sent = tx.send(Ok("more ".to_string())) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                },
                StreamMode::StallAfterFirst => {
                    let _ = tx.send(Ok("Trimmed ".to_string())).await;
                    cancel.cancelled().await;
                    cancelled.store(true, Ordering::SeqCst);
                }
            }
        });
        Ok(rx)
    }

    async fn structured_chat(
        &self,
        _system: &str,
        user: &str,
        _cancel: CancellationToken,
    ) -> Result<StructuredReply> {
        self.structured_calls.fetch_add(1, Ordering::SeqCst);
        if user.contains("HOLD") {
            let _permit = self.gate.acquire().await?;
        }
        if user.contains("FAIL") {
            return Err(anyhow!("model refused"));
        }
        let opening: String = user.chars().take(24).collect();
        Ok(StructuredReply {
            trimmed_text: format!("Condensed: {}", opening),
            summary: format!("Summary of: {}", opening),
            tokens_used: None,
        })
    }

    async fn chat(&self, system: &str, user: &str, _cancel: CancellationToken) -> Result<String> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        if system == ENCYCLOPEDIA_POLICY {
            Ok("Characters: the traveller.".to_string())
        } else {
            let opening: String = user.chars().take(24).collect();
            Ok(format!("Summary of: {}", opening))
        }
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

struct Fixture {
    app: StoryTrim,
    llm: Arc<ScriptedLlm>,
    stores: Stores,
    prompt_id: i64,
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.trim.replay_interval_ms = 0;
    config.trim.replay_chunk_chars = 4;
    config
}

async fn fixture_with(config: Config) -> Fixture {
    let stores = Stores::shared(Arc::new(InMemoryStore::new()));
    let prompts = migrate::seed_prompts(stores.prompts.as_ref()).await.unwrap();
    let prompt_id = prompts.iter().find(|p| p.name == "standard").unwrap().id;
    let llm = ScriptedLlm::new();
    let app = StoryTrim::new(&config, stores.clone(), llm.clone());
    Fixture {
        app,
        llm,
        stores,
        prompt_id,
    }
}

async fn fixture() -> Fixture {
    fixture_with(test_config()).await
}

/// `n` chapters with distinct bodies. Chapters listed in `marked`
/// (1-based) carry `marker` in their body.
fn book_text(n: usize, marked: &[usize], marker: &str) -> String {
    (1..=n)
        .map(|i| {
            let tag = if marked.contains(&i) { marker } else { "" };
            format!(
                "Chapter {i} The Road\nThis is chapter {i}. {tag}{}\n",
                "The traveller walked on through the rain and the cold wind. ".repeat(6)
            )
        })
        .collect()
}

async fn import(fx: &Fixture, user: UserContext, text: &str) -> (Book, Vec<Chapter>) {
    let book = fx.app.import_book(user, "The Road", text).await.unwrap();
    let chapters = fx.stores.content.list_chapters(book.id).await.unwrap();
    (book, chapters)
}

async fn wait_for_task(fx: &Fixture, task_id: &str) -> Task {
    for _ in 0..500 {
        let task = fx.app.get_task(task_id).await.unwrap();
        if task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not finish");
}

async fn wait_for_summary(fx: &Fixture, book: &Book, before_index: i64) {
    for _ in 0..500 {
        let summaries = fx
            .stores
            .memory
            .recent_summaries(&book.book_fingerprint, before_index, 5)
            .await
            .unwrap();
        if !summaries.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("summary never written");
}

// ─── Streaming ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_stream_miss_then_hit_replays_same_text() {
    let fx = fixture().await;
    let user = UserContext::user(7);
    let (book, chapters) = import(&fx, user, &book_text(3, &[], "")).await;
    let first = &chapters[0];

    let stream = fx
        .app
        .stream_trim(user, first.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Miss);
    assert_eq!(stream.level, ContextLevel::None);
    assert_eq!(stream.collect().await.unwrap(), STREAMED);

    let stream = fx
        .app
        .stream_trim(user, first.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Hit);
    assert_eq!(stream.collect().await.unwrap(), STREAMED);
    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 1);

    let entries = fx
        .stores
        .cache
        .list_trim_results(&first.fingerprint, fx.prompt_id, 1)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].trimmed_chars, STREAMED.chars().count() as i64);

    let status = fx
        .app
        .book_trim_status(user, book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(status.processed_chapters, 1);

    let progress = fx
        .stores
        .cache
        .get_reading_progress(7, book.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(progress.last_chapter_id, first.id);
    assert_eq!(progress.last_prompt_id, fx.prompt_id);
}

#[tokio::test]
async fn test_stream_first_increment_error_is_returned() {
    let fx = fixture().await;
    fx.llm.set_mode(StreamMode::FailFirst);
    let (_, chapters) = import(&fx, UserContext::anonymous(), &book_text(2, &[], "")).await;

    let err = fx
        .app
        .stream_trim(
            UserContext::anonymous(),
            chapters[0].id,
            fx.prompt_id,
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::Llm(_)));

    let entries = fx
        .stores
        .cache
        .list_trim_results(&chapters[0].fingerprint, fx.prompt_id, 1)
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_stream_midway_error_persists_nothing() {
    let fx = fixture().await;
    fx.llm.set_mode(StreamMode::FailMidway);
    let (_, chapters) = import(&fx, UserContext::anonymous(), &book_text(2, &[], "")).await;

    let mut stream = fx
        .app
        .stream_trim(
            UserContext::anonymous(),
            chapters[0].id,
            fx.prompt_id,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(stream.receiver.recv().await.unwrap().unwrap(), "Trimmed ");
    let err = stream.receiver.recv().await.unwrap().err().unwrap();
    assert!(matches!(err, TrimError::Llm(_)));
    assert!(stream.receiver.recv().await.is_none());

    let entries = fx
        .stores
        .cache
        .list_trim_results(&chapters[0].fingerprint, fx.prompt_id, 1)
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_dropped_reader_cancels_upstream() {
    let fx = fixture().await;
    fx.llm.set_mode(StreamMode::Endless);
    let (_, chapters) = import(&fx, UserContext::anonymous(), &book_text(2, &[], "")).await;

    let mut stream = fx
        .app
        .stream_trim(
            UserContext::anonymous(),
            chapters[0].id,
            fx.prompt_id,
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(stream.receiver.recv().await.unwrap().is_ok());
    drop(stream);

    for _ in 0..200 {
        if fx.llm.upstream_cancelled.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(fx.llm.upstream_cancelled.load(Ordering::SeqCst));

    let entries = fx
        .stores
        .cache
        .list_trim_results(&chapters[0].fingerprint, fx.prompt_id, 1)
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_cancelled_stream_persists_nothing() {
    let fx = fixture().await;
    fx.llm.set_mode(StreamMode::StallAfterFirst);
    let user = UserContext::user(4);
    let (book, chapters) = import(&fx, user, &book_text(2, &[], "")).await;

    for _ in 0..50 {
        let cancel = CancellationToken::new();
        let mut stream = fx
            .app
            .stream_trim(user, chapters[0].id, fx.prompt_id, cancel.clone())
            .await
            .unwrap();
        assert_eq!(stream.source, StreamSource::Miss);
        assert_eq!(stream.receiver.recv().await.unwrap().unwrap(), "Trimmed ");

        cancel.cancel();
        // The channel closes only after the generation task has decided
        // whether to persist.
        while let Some(item) = stream.receiver.recv().await {
            assert!(item.is_ok());
        }
    }

    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 50);
    assert!(fx.llm.upstream_cancelled.load(Ordering::SeqCst));
    let entries = fx
        .stores
        .cache
        .list_trim_results(&chapters[0].fingerprint, fx.prompt_id, 1)
        .await
        .unwrap();
    assert!(entries.is_empty());

    let status = fx
        .app
        .book_trim_status(user, book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(status.processed_chapters, 0);
}

#[tokio::test]
async fn test_stream_summary_is_built_from_trim() {
    let fx = fixture().await;
    let (book, chapters) = import(&fx, UserContext::anonymous(), &book_text(2, &[], "")).await;

    fx.app
        .stream_trim(
            UserContext::anonymous(),
            chapters[0].id,
            fx.prompt_id,
            CancellationToken::new(),
        )
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    wait_for_summary(&fx, &book, 1).await;

    let summaries = fx
        .stores
        .memory
        .recent_summaries(&book.book_fingerprint, 1, 5)
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].content, format!("Summary of: {STREAMED}"));
}

#[tokio::test]
async fn test_stale_entry_is_upgraded_and_kept() {
    let fx = fixture().await;
    let user = UserContext::user(3);
    let (book, chapters) = import(&fx, user, &book_text(3, &[], "")).await;
    let second = &chapters[1];

    // No summaries yet: the second chapter is trimmed without context.
    let stream = fx
        .app
        .stream_trim(user, second.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.level, ContextLevel::None);
    stream.collect().await.unwrap();

    // Trimming the first chapter leaves a summary behind.
    fx.app
        .stream_trim(user, chapters[0].id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap()
        .collect()
        .await
        .unwrap();
    wait_for_summary(&fx, &book, 1).await;

    let stream = fx
        .app
        .stream_trim(user, second.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Miss);
    assert_eq!(stream.level, ContextLevel::Partial);
    stream.collect().await.unwrap();

    let mut levels: Vec<ContextLevel> = fx
        .stores
        .cache
        .list_trim_results(&second.fingerprint, fx.prompt_id, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.level)
        .collect();
    levels.sort();
    assert_eq!(levels, vec![ContextLevel::None, ContextLevel::Partial]);

    let stream = fx
        .app
        .stream_trim(user, second.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Hit);
    assert_eq!(stream.level, ContextLevel::Partial);
    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_partial_entry_is_upgraded_to_full() {
    let mut config = test_config();
    config.memory.summary_limit = 2;
    config.memory.encyclopedia_interval = 100;
    let fx = fixture_with(config).await;
    let user = UserContext::user(6);
    let (book, chapters) = import(&fx, user, &book_text(4, &[], "")).await;
    let target = &chapters[3];
    let summary = |index: usize| ChapterSummary {
        book_fingerprint: book.book_fingerprint.clone(),
        chapter_index: index as i64,
        chapter_fingerprint: chapters[index].fingerprint.clone(),
        content: format!("Chapter {index} happened."),
        created_at: 0,
    };

    fx.stores.memory.upsert_summary(&summary(0)).await.unwrap();
    let stream = fx
        .app
        .stream_trim(user, target.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Miss);
    assert_eq!(stream.level, ContextLevel::Partial);
    stream.collect().await.unwrap();

    // Enough summaries plus an encyclopedia make full context reachable.
    fx.stores.memory.upsert_summary(&summary(1)).await.unwrap();
    let appended = fx
        .stores
        .memory
        .append_encyclopedia(&Encyclopedia {
            book_fingerprint: book.book_fingerprint.clone(),
            range_end: 1,
            content: "Characters: the traveller.".to_string(),
            created_at: 0,
        })
        .await
        .unwrap();
    assert!(appended);

    let stream = fx
        .app
        .stream_trim(user, target.id, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Miss);
    assert_eq!(stream.level, ContextLevel::Full);
    assert_eq!(stream.collect().await.unwrap(), STREAMED);
    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 2);

    let mut levels: Vec<ContextLevel> = fx
        .stores
        .cache
        .list_trim_results(&target.fingerprint, fx.prompt_id, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.level)
        .collect();
    levels.sort();
    assert_eq!(levels, vec![ContextLevel::Partial, ContextLevel::Full]);

    // A caller with no context is still served the best cached trim.
    let raw = fx
        .stores
        .content
        .get_raw_content(&target.fingerprint)
        .await
        .unwrap()
        .unwrap();
    let stream = fx
        .app
        .stream_trim_text(&raw.text, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Hit);
    assert_eq!(stream.level, ContextLevel::Full);
    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stream_trim_text() {
    let fx = fixture().await;
    let text = "A short passage that is not part of any book.";

    let stream = fx
        .app
        .stream_trim_text(text, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Miss);
    assert_eq!(stream.level, ContextLevel::None);
    assert_eq!(stream.collect().await.unwrap(), STREAMED);

    let stream = fx
        .app
        .stream_trim_text(text, fx.prompt_id, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stream.source, StreamSource::Hit);
    assert_eq!(stream.collect().await.unwrap(), STREAMED);
    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 1);

    let err = fx
        .app
        .stream_trim_text("   \n", fx.prompt_id, CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::InvalidInput(_)));
}

#[tokio::test]
async fn test_stream_rejects_summary_prompt() {
    let fx = fixture().await;
    let (_, chapters) = import(&fx, UserContext::anonymous(), &book_text(2, &[], "")).await;
    let summary_prompt = fx
        .stores
        .prompts
        .list_prompts()
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.name == "summary")
        .unwrap();

    let err = fx
        .app
        .stream_trim(
            UserContext::anonymous(),
            chapters[0].id,
            summary_prompt.id,
            CancellationToken::new(),
        )
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::InvalidInput(_)));

    let err = fx
        .app
        .stream_trim(UserContext::anonymous(), 9999, fx.prompt_id, CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::NotFound(_)));
}

// ─── Batch ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_batch_with_partial_failures_completes() {
    let fx = fixture().await;
    let user = UserContext::user(5);
    let (book, _) = import(&fx, user, &book_text(10, &[3, 6, 9], "FAIL ")).await;

    let task_id = fx.app.submit_batch(user, book.id, fx.prompt_id).await.unwrap();
    let task = wait_for_task(&fx, &task_id).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress, 100);
    assert!(task.elapsed_ms.is_some());
    let error = task.error.unwrap();
    assert_eq!(error.lines().count(), 3);

    let items = fx.app.get_task_items(&task_id).await.unwrap();
    assert_eq!(items.len(), 10);
    let failed: Vec<i64> = items
        .iter()
        .filter(|i| i.status == TaskItemStatus::Failed)
        .map(|i| i.chapter_index)
        .collect();
    assert_eq!(failed, vec![2, 5, 8]);
    assert_eq!(
        items.iter().filter(|i| i.status == TaskItemStatus::Done).count(),
        7
    );

    let status = fx
        .app
        .book_trim_status(user, book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(status.processed_chapters, 7);
    assert!(!status.ready);

    // Ten completions close one rollup interval at the highest success.
    let enc = fx
        .stores
        .memory
        .get_encyclopedia(&book.book_fingerprint, 9)
        .await
        .unwrap();
    assert!(enc.is_some());
}

#[tokio::test]
async fn test_batch_all_failing_is_failed() {
    let fx = fixture().await;
    let (book, _) = import(&fx, UserContext::anonymous(), &book_text(4, &[1, 2, 3, 4], "FAIL ")).await;

    let task_id = fx
        .app
        .submit_batch(UserContext::anonymous(), book.id, fx.prompt_id)
        .await
        .unwrap();
    let task = wait_for_task(&fx, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.progress, 100);
    assert_eq!(task.error.unwrap().lines().count(), 4);
}

#[tokio::test]
async fn test_batch_rerun_is_served_from_cache() {
    let fx = fixture().await;
    let user = UserContext::user(2);
    let (book, _) = import(&fx, user, &book_text(1, &[], "")).await;

    let first = fx.app.submit_batch(user, book.id, fx.prompt_id).await.unwrap();
    assert_eq!(wait_for_task(&fx, &first).await.status, TaskStatus::Completed);
    let second = fx.app.submit_batch(user, book.id, fx.prompt_id).await.unwrap();
    let task = wait_for_task(&fx, &second).await;

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error, None);
    assert_eq!(fx.llm.structured_calls.load(Ordering::SeqCst), 1);

    let status = fx
        .app
        .book_trim_status(user, book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(status.processed_chapters, 1);
    assert!(status.ready);
}

#[tokio::test]
async fn test_batch_queue_full_marks_task_failed() {
    let mut config = test_config();
    config.workers.batch_workers = 1;
    config.workers.batch_queue = 1;
    let fx = fixture_with(config).await;
    let user = UserContext::anonymous();
    let (held, _) = import(&fx, user, &book_text(1, &[1], "HOLD ")).await;
    let (other, _) = import(&fx, user, &book_text(2, &[], "")).await;

    let running = fx.app.submit_batch(user, held.id, fx.prompt_id).await.unwrap();
    for _ in 0..500 {
        if fx.llm.structured_calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        fx.app.get_task(&running).await.unwrap().status,
        TaskStatus::Running
    );

    let queued = fx.app.submit_batch(user, other.id, fx.prompt_id).await.unwrap();
    let dropped = fx.app.submit_batch(user, other.id, fx.prompt_id).await.unwrap();

    let task = fx.app.get_task(&dropped).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_deref(), Some(QUEUE_FULL_ERROR));
    assert_eq!(
        fx.app.get_task(&queued).await.unwrap().status,
        TaskStatus::Pending
    );

    fx.llm.gate.add_permits(10);
    assert_eq!(wait_for_task(&fx, &running).await.status, TaskStatus::Completed);
    assert_eq!(wait_for_task(&fx, &queued).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_batch_rejects_unknown_book() {
    let fx = fixture().await;
    let err = fx
        .app
        .submit_batch(UserContext::anonymous(), 404, fx.prompt_id)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::NotFound(_)));
}

// ─── Library ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_import_keeps_preface_as_first_chapter() {
    let fx = fixture().await;
    let text = format!("A note from the author.\n\n{}", book_text(3, &[], ""));

    let (book, chapters) = import(&fx, UserContext::user(1), &text).await;
    assert_eq!(book.total_chapters, 4);
    assert_eq!(book.user_id, Some(1));
    assert_eq!(chapters[0].title, "Preface");
    assert_eq!(chapters[0].index, 0);
    assert_eq!(chapters[1].title, "Chapter 1 The Road");
    assert_eq!(book.book_fingerprint, chapters[0].fingerprint);

    let raw = fx
        .stores
        .content
        .get_raw_content(&chapters[2].fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert!(raw.text.starts_with("This is chapter 2."));
}

#[tokio::test]
async fn test_blank_chapter_is_never_trimmed() {
    let fx = fixture().await;
    let user = UserContext::user(8);
    let body = |i: usize| {
        format!(
            "This is chapter {i}. {}",
            "The traveller walked on through the rain and the cold wind. ".repeat(6)
        )
    };
    let text = format!(
        "Chapter 1 The Road\n{}\nChapter 2 Interlude\n* * *\nChapter 3 The End\n{}\n",
        body(1),
        body(3)
    );
    let (book, chapters) = import(&fx, user, &text).await;
    assert_eq!(chapters.len(), 3);
    assert!(is_blank(&chapters[1].fingerprint));

    let err = fx
        .app
        .stream_trim(user, chapters[1].id, fx.prompt_id, CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::InvalidInput(_)));
    assert_eq!(fx.llm.stream_calls.load(Ordering::SeqCst), 0);

    let task_id = fx.app.submit_batch(user, book.id, fx.prompt_id).await.unwrap();
    let task = wait_for_task(&fx, &task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.error, None);
    assert_eq!(fx.llm.structured_calls.load(Ordering::SeqCst), 2);
    let items = fx.app.get_task_items(&task_id).await.unwrap();
    assert!(items.iter().all(|i| i.status == TaskItemStatus::Done));

    let blank = fx
        .stores
        .cache
        .list_trim_results(&fingerprint(""), fx.prompt_id, 1)
        .await
        .unwrap();
    assert!(blank.is_empty());
}

#[tokio::test]
async fn test_import_rejects_empty_text() {
    let fx = fixture().await;
    let err = fx
        .app
        .import_book(UserContext::anonymous(), "Blank", "  \n\n ")
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TrimError::InvalidInput(_)));
}

#[tokio::test]
async fn test_readiness_threshold() {
    let fx = fixture().await;
    let user = UserContext::user(9);
    let (book, chapters) = import(&fx, user, &book_text(10, &[], "")).await;

    for chapter in chapters.iter().take(7) {
        fx.stores
            .cache
            .record_footprint(&story_trim_core::models::UserProcessedChapter {
                user_id: 9,
                book_id: book.id,
                chapter_id: chapter.id,
                prompt_id: fx.prompt_id,
                created_at: 0,
            })
            .await
            .unwrap();
    }
    let status = fx
        .app
        .book_trim_status(user, book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(status.required_chapters, 8);
    assert!(!status.ready);

    fx.stores
        .cache
        .record_footprint(&story_trim_core::models::UserProcessedChapter {
            user_id: 9,
            book_id: book.id,
            chapter_id: chapters[7].id,
            prompt_id: fx.prompt_id,
            created_at: 0,
        })
        .await
        .unwrap();
    let status = fx
        .app
        .book_trim_status(user, book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(status.processed_chapters, 8);
    assert!(status.ready);

    let anonymous = fx
        .app
        .book_trim_status(UserContext::anonymous(), book.id, fx.prompt_id)
        .await
        .unwrap();
    assert_eq!(anonymous.processed_chapters, 0);
}

#[tokio::test]
async fn test_delete_book() {
    let fx = fixture().await;
    let (book, _) = import(&fx, UserContext::anonymous(), &book_text(2, &[], "")).await;

    fx.app.delete_book(book.id).await.unwrap();
    assert!(fx.stores.content.get_book(book.id).await.unwrap().is_none());
    let err = fx.app.delete_book(book.id).await.err().unwrap();
    assert!(matches!(err, TrimError::NotFound(_)));
    fx.app.shutdown().await;
}
