//! Streaming trim of a single chapter.
//!
//! [`StreamTrimmer::stream_trim`] resolves the chapter against the trim
//! cache and returns a [`TrimStream`] whose receiver yields text
//! increments:
//!
//! - **Hit**: the cached text is replayed in fixed-size character slices
//!   with a short delay, so readers see the same incremental rendering as
//!   a live generation.
//! - **Miss**: the model is streamed. The first increment is awaited
//!   before returning, so connection and credential failures surface as
//!   an error from `stream_trim` itself. A detached task then forwards
//!   increments and accumulates the full text. On a clean end the result
//!   is persisted once, the footprint and reading progress are updated,
//!   and a background job summarizes the finished trim.
//!
//! A mid-stream model error is forwarded as a single `Err` item and
//! nothing is persisted. If the reader drops the receiver or the cancel
//! token fires, forwarding stops, the upstream request is cancelled, and
//! nothing is persisted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use story_trim_core::context::{ContextLevel, MemoryContext};
use story_trim_core::fingerprint::{fingerprint, is_blank, raw_content};
use story_trim_core::models::{
    now_ts, Book, Chapter, Prompt, PromptKind, RawContent, ReadingProgress, TrimResult,
    UserContext,
};
use story_trim_core::prompt::{build_trim_system_prompt, replay_slices};
use story_trim_core::store::Stores;

use crate::cache::{build_result, TrimCache};
use crate::config::TrimConfig;
use crate::error::{ServiceResult, TrimError};
use crate::llm::{ChatStream, LlmPort};
use crate::memory::SummaryJob;
use crate::worker::WorkerPool;

/// Capacity of the channel handed to the reader.
const OUTPUT_BUFFER: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Hit,
    Miss,
}

pub struct TrimStream {
    pub source: StreamSource,
    /// Level of the served entry on a hit, or of the entry being generated.
    pub level: ContextLevel,
    pub receiver: mpsc::Receiver<Result<String, TrimError>>,
}

impl TrimStream {
    /// Drain the stream into one string, stopping at the first error.
    pub async fn collect(mut self) -> ServiceResult<String> {
        let mut out = String::new();
        while let Some(item) = self.receiver.recv().await {
            out.push_str(&item?);
        }
        Ok(out)
    }
}

/// Per-chapter bookkeeping done after a successful generation.
struct ChapterTarget {
    user: UserContext,
    book: Book,
    chapter: Chapter,
}

pub struct StreamTrimmer {
    stores: Stores,
    cache: Arc<TrimCache>,
    llm: Arc<dyn LlmPort>,
    background: Arc<WorkerPool>,
    replay_chunk_chars: usize,
    replay_interval: Duration,
}

impl StreamTrimmer {
    pub fn new(
        stores: Stores,
        cache: Arc<TrimCache>,
        llm: Arc<dyn LlmPort>,
        background: Arc<WorkerPool>,
        config: &TrimConfig,
    ) -> Self {
        Self {
            stores,
            cache,
            llm,
            background,
            replay_chunk_chars: config.replay_chunk_chars.max(1),
            replay_interval: config.replay_interval(),
        }
    }

    async fn trim_prompt(&self, prompt_id: i64) -> ServiceResult<Prompt> {
        let prompt = self
            .stores
            .prompts
            .get_prompt(prompt_id)
            .await?
            .ok_or_else(|| TrimError::not_found("prompt", prompt_id))?;
        if prompt.kind != PromptKind::Trim {
            return Err(TrimError::InvalidInput(format!(
                "prompt {} is a {} prompt, not a trim prompt",
                prompt_id,
                prompt.kind.as_str()
            )));
        }
        Ok(prompt)
    }

    /// Trim one chapter of an imported book.
    pub async fn stream_trim(
        &self,
        user: UserContext,
        chapter_id: i64,
        prompt_id: i64,
        cancel: CancellationToken,
    ) -> ServiceResult<TrimStream> {
        let chapter = self
            .stores
            .content
            .get_chapter(chapter_id)
            .await?
            .ok_or_else(|| TrimError::not_found("chapter", chapter_id))?;
        if is_blank(&chapter.fingerprint) {
            return Err(TrimError::InvalidInput(format!(
                "chapter {chapter_id} has no text to trim"
            )));
        }
        let book = self
            .stores
            .content
            .get_book(chapter.book_id)
            .await?
            .ok_or_else(|| TrimError::not_found("book", chapter.book_id))?;
        let prompt = self.trim_prompt(prompt_id).await?;

        let resolution = self.cache.resolve(&book, &chapter, &prompt).await?;

        if let Some(hit) = resolution.cached {
            tracing::debug!(book_id = book.id, chapter_index = chapter.index, level = %hit.level, "trim cache hit");
            self.cache
                .record_footprint(user, book.id, chapter.id, prompt.id)
                .await?;
            self.update_progress(user, book.id, chapter.id, prompt.id).await;
            return Ok(self.replay(hit, cancel));
        }

        let raw = self
            .stores
            .content
            .get_raw_content(&chapter.fingerprint)
            .await?
            .ok_or_else(|| TrimError::not_found("raw content", &chapter.fingerprint))?;

        tracing::info!(book_id = book.id, chapter_index = chapter.index, level = %resolution.level, "trimming chapter");
        self.generate(
            raw,
            prompt,
            resolution.level,
            &resolution.context,
            Some(ChapterTarget {
                user,
                book,
                chapter,
            }),
            cancel,
        )
        .await
    }

    /// Trim free text outside any book. Always context level 0, and no
    /// per-user records or summaries are written.
    pub async fn stream_trim_text(
        &self,
        text: &str,
        prompt_id: i64,
        cancel: CancellationToken,
    ) -> ServiceResult<TrimStream> {
        if is_blank(&fingerprint(text)) {
            return Err(TrimError::InvalidInput("text is empty".to_string()));
        }
        let prompt = self.trim_prompt(prompt_id).await?;

        let raw = raw_content(text, now_ts());
        self.stores.content.save_raw_content(&raw).await?;

        if let Some(hit) = self
            .cache
            .lookup(&raw.fingerprint, &prompt, ContextLevel::None)
            .await?
        {
            return Ok(self.replay(hit, cancel));
        }

        self.generate(
            raw,
            prompt,
            ContextLevel::None,
            &MemoryContext::default(),
            None,
            cancel,
        )
        .await
    }

    fn replay(&self, hit: TrimResult, cancel: CancellationToken) -> TrimStream {
        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let slices = replay_slices(&hit.trimmed_text, self.replay_chunk_chars);
        let interval = self.replay_interval;

        tokio::spawn(async move {
            for (i, slice) in slices.into_iter().enumerate() {
                if i > 0 && !interval.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                if !forward(&tx, Ok(slice), &cancel).await {
                    return;
                }
            }
        });

        TrimStream {
            source: StreamSource::Hit,
            level: hit.level,
            receiver: rx,
        }
    }

    async fn generate(
        &self,
        raw: RawContent,
        prompt: Prompt,
        level: ContextLevel,
        context: &MemoryContext,
        target: Option<ChapterTarget>,
        cancel: CancellationToken,
    ) -> ServiceResult<TrimStream> {
        let system = build_trim_system_prompt(&prompt, raw.char_count, context);
        let upstream = cancel.child_token();
        let started = Instant::now();

        let mut llm_rx = self
            .llm
            .stream_chat(&system, &raw.text, upstream.clone())
            .await
            .map_err(TrimError::llm)?;

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                upstream.cancel();
                return Err(TrimError::Cancelled);
            }
            item = llm_rx.recv() => item,
        };
        let first = match first {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(TrimError::llm(e)),
            None => return Err(TrimError::Llm("model returned no output".to_string())),
        };

        let (tx, rx) = mpsc::channel(OUTPUT_BUFFER);
        let finisher = Finisher {
            stores: self.stores.clone(),
            cache: self.cache.clone(),
            background: self.background.clone(),
            raw,
            prompt,
            level,
            target,
            started,
        };

        tokio::spawn(async move {
            match pump(first, &mut llm_rx, &tx, &cancel).await {
                Some(full) => finisher.finish(full).await,
                None => {
                    upstream.cancel();
                    tracing::debug!("trim stream ended without a result, nothing persisted");
                }
            }
            // Dropping `tx` here closes the reader's stream after persistence.
        });

        Ok(TrimStream {
            source: StreamSource::Miss,
            level,
            receiver: rx,
        })
    }

    async fn update_progress(&self, user: UserContext, book_id: i64, chapter_id: i64, prompt_id: i64) {
        update_progress(&self.stores, user, book_id, chapter_id, prompt_id).await;
    }
}

/// Send one item unless the reader is gone or the caller cancelled.
async fn forward(
    tx: &mpsc::Sender<Result<String, TrimError>>,
    item: Result<String, TrimError>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Forward increments until the model finishes. Returns the full text on
/// a clean end, `None` on error, cancellation, or a dropped reader.
async fn pump(
    first: String,
    llm_rx: &mut ChatStream,
    tx: &mpsc::Sender<Result<String, TrimError>>,
    cancel: &CancellationToken,
) -> Option<String> {
    let mut full = first.clone();
    if !forward(tx, Ok(first), cancel).await {
        return None;
    }

    loop {
        // A cancelled provider closes its channel cleanly, so cancellation
        // must win over end-of-stream.
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            _ = tx.closed() => return None,
            item = llm_rx.recv() => item,
        };
        match item {
            None if cancel.is_cancelled() || tx.is_closed() => return None,
            None => return Some(full),
            Some(Ok(text)) => {
                full.push_str(&text);
                if !forward(tx, Ok(text), cancel).await {
                    return None;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "model stream failed mid-generation");
                let _ = forward(tx, Err(TrimError::llm(e)), cancel).await;
                return None;
            }
        }
    }
}

/// Everything needed to persist a finished generation.
struct Finisher {
    stores: Stores,
    cache: Arc<TrimCache>,
    background: Arc<WorkerPool>,
    raw: RawContent,
    prompt: Prompt,
    level: ContextLevel,
    target: Option<ChapterTarget>,
    started: Instant,
}

impl Finisher {
    async fn finish(self, full: String) {
        if full.trim().is_empty() {
            tracing::warn!(fingerprint = %self.raw.fingerprint, "model produced only whitespace, nothing persisted");
            return;
        }

        let latency_ms = self.started.elapsed().as_millis() as i64;
        let result = build_result(&self.raw, &self.prompt, self.level, full, latency_ms);
        if let Err(e) = self.stores.cache.upsert_trim_result(&result).await {
            tracing::warn!(error = %e, fingerprint = %self.raw.fingerprint, "failed to persist trim result");
            return;
        }
        tracing::info!(fingerprint = %self.raw.fingerprint, level = %result.level, ratio = result.ratio, latency_ms, "trim persisted");

        let Some(target) = self.target else {
            return;
        };
        let ChapterTarget { user, book, chapter } = target;

        if let Err(e) = self
            .cache
            .record_footprint(user, book.id, chapter.id, self.prompt.id)
            .await
        {
            tracing::warn!(error = %e, book_id = book.id, chapter_index = chapter.index, "failed to record footprint");
        }
        update_progress(&self.stores, user, book.id, chapter.id, self.prompt.id).await;

        let job = SummaryJob {
            memory: self.cache.memory().clone(),
            book_fp: book.book_fingerprint.clone(),
            chapter_index: chapter.index,
            chapter_fp: chapter.fingerprint.clone(),
            text: result.trimmed_text,
        };
        if !self.background.try_submit(Box::new(job)) {
            tracing::warn!(book_id = book.id, chapter_index = chapter.index, "summary job dropped");
        }
    }
}

async fn update_progress(
    stores: &Stores,
    user: UserContext,
    book_id: i64,
    chapter_id: i64,
    prompt_id: i64,
) {
    let Some(user_id) = user.user_id else {
        return;
    };
    let progress = ReadingProgress {
        user_id,
        book_id,
        last_chapter_id: chapter_id,
        last_prompt_id: prompt_id,
        updated_at: now_ts(),
    };
    if let Err(e) = stores.cache.upsert_reading_progress(&progress).await {
        tracing::warn!(error = %e, book_id, "failed to update reading progress");
    }
}
