//! Trim cache with quality-tiered invalidation.
//!
//! Trims are keyed by `(content fingerprint, prompt id, prompt version,
//! context level)`. A lookup first computes the context level that is
//! reachable *now* from progressive memory, then serves the highest
//! cached level, provided it is at or above the reachable one. When every cached level is below the reachable
//! one the entry is stale: it is regenerated at the higher level and the
//! old row stays in place.
//!
//! ```text
//! resolve ──► level = f(summaries, encyclopedia)
//!        └──► entries(fp, prompt, version) ──► select_authoritative(level)
//!                                                 │ Some → hit
//!                                                 │ None → structured_chat → upsert(level)
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use story_trim_core::context::{select_authoritative, ContextLevel, MemoryContext};
use story_trim_core::fingerprint::{estimate_tokens, is_blank};
use story_trim_core::models::{
    now_ts, Book, Chapter, ContentFingerprint, Prompt, RawContent, TrimResult, UserContext,
    UserProcessedChapter,
};
use story_trim_core::prompt::{build_batch_system_prompt, compression_ratio};
use story_trim_core::store::Stores;

use crate::error::{ServiceResult, TrimError};
use crate::llm::LlmPort;
use crate::memory::ProgressiveMemory;

/// What the cache knows about one chapter under one prompt right now.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub context: MemoryContext,
    pub level: ContextLevel,
    /// Authoritative entry for `level`, if any.
    pub cached: Option<TrimResult>,
}

#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Hit(TrimResult),
    Computed(TrimResult),
}

impl CacheOutcome {
    pub fn result(&self) -> &TrimResult {
        match self {
            CacheOutcome::Hit(r) | CacheOutcome::Computed(r) => r,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, CacheOutcome::Hit(_))
    }
}

pub struct TrimCache {
    stores: Stores,
    memory: Arc<ProgressiveMemory>,
    llm: Arc<dyn LlmPort>,
}

impl TrimCache {
    pub fn new(stores: Stores, memory: Arc<ProgressiveMemory>, llm: Arc<dyn LlmPort>) -> Self {
        Self { stores, memory, llm }
    }

    pub fn memory(&self) -> &Arc<ProgressiveMemory> {
        &self.memory
    }

    /// Compute the reachable level for `chapter` and find the entry to serve.
    pub async fn resolve(
        &self,
        book: &Book,
        chapter: &Chapter,
        prompt: &Prompt,
    ) -> anyhow::Result<Resolution> {
        let context = self
            .memory
            .get_context(&book.book_fingerprint, chapter.index)
            .await?;
        let level = self.memory.level_of(&context);
        let cached = self.lookup(&chapter.fingerprint, prompt, level).await?;
        Ok(Resolution {
            context,
            level,
            cached,
        })
    }

    /// Authoritative entry for `fp` under `prompt` at `level`.
    pub async fn lookup(
        &self,
        fp: &ContentFingerprint,
        prompt: &Prompt,
        level: ContextLevel,
    ) -> anyhow::Result<Option<TrimResult>> {
        let entries = self
            .stores
            .cache
            .list_trim_results(fp, prompt.id, prompt.version)
            .await?;
        Ok(select_authoritative(&entries, level).cloned())
    }

    /// Serve the chapter from cache or regenerate it (trim and summary in
    /// one structured call) at the current level.
    pub async fn get_or_compute(
        &self,
        user: UserContext,
        book: &Book,
        chapter: &Chapter,
        prompt: &Prompt,
        cancel: CancellationToken,
    ) -> ServiceResult<CacheOutcome> {
        if is_blank(&chapter.fingerprint) {
            return Err(TrimError::InvalidInput(format!(
                "chapter {} has no text to trim",
                chapter.index
            )));
        }
        let resolution = self.resolve(book, chapter, prompt).await?;
        if let Some(hit) = resolution.cached {
            self.record_footprint(user, book.id, chapter.id, prompt.id).await?;
            return Ok(CacheOutcome::Hit(hit));
        }

        let raw = self
            .stores
            .content
            .get_raw_content(&chapter.fingerprint)
            .await?
            .ok_or_else(|| TrimError::not_found("raw content", &chapter.fingerprint))?;

        let instruction = self.memory.summary_instruction().await?;
        let system =
            build_batch_system_prompt(prompt, &instruction, raw.char_count, &resolution.context);

        let started = Instant::now();
        let reply = self
            .llm
            .structured_chat(&system, &raw.text, cancel.clone())
            .await
            .map_err(|e| {
                if cancel.is_cancelled() {
                    TrimError::Cancelled
                } else {
                    TrimError::llm(e)
                }
            })?;
        let latency_ms = started.elapsed().as_millis() as i64;

        if reply.trimmed_text.trim().is_empty() {
            return Err(TrimError::Llm("model returned an empty trim".to_string()));
        }

        let mut result = build_result(&raw, prompt, resolution.level, reply.trimmed_text, latency_ms);
        if let Some(tokens) = reply.tokens_used {
            result.tokens_consumed = tokens;
        }
        self.stores.cache.upsert_trim_result(&result).await?;

        if !reply.summary.trim().is_empty() {
            self.memory
                .save_summary(&book.book_fingerprint, chapter.index, &chapter.fingerprint, &reply.summary)
                .await?;
        }
        self.record_footprint(user, book.id, chapter.id, prompt.id).await?;

        tracing::debug!(
            book_id = book.id,
            chapter_index = chapter.index,
            level = %result.level,
            ratio = result.ratio,
            latency_ms,
            "chapter trimmed"
        );
        Ok(CacheOutcome::Computed(result))
    }

    /// Record that `user` processed a chapter. No-op for anonymous callers.
    pub async fn record_footprint(
        &self,
        user: UserContext,
        book_id: i64,
        chapter_id: i64,
        prompt_id: i64,
    ) -> anyhow::Result<()> {
        let Some(user_id) = user.user_id else {
            return Ok(());
        };
        self.stores
            .cache
            .record_footprint(&UserProcessedChapter {
                user_id,
                book_id,
                chapter_id,
                prompt_id,
                created_at: now_ts(),
            })
            .await
    }
}

/// Assemble a [`TrimResult`] for `trimmed` produced from `raw`.
///
/// Token usage is estimated from input plus output length.
pub fn build_result(
    raw: &RawContent,
    prompt: &Prompt,
    level: ContextLevel,
    trimmed: String,
    latency_ms: i64,
) -> TrimResult {
    let trimmed_chars = trimmed.chars().count() as i64;
    TrimResult {
        fingerprint: raw.fingerprint.clone(),
        prompt_id: prompt.id,
        prompt_version: prompt.version,
        level,
        ratio: compression_ratio(trimmed_chars, raw.char_count),
        tokens_consumed: raw.token_estimate + estimate_tokens(trimmed_chars),
        trimmed_text: trimmed,
        trimmed_chars,
        latency_ms,
        created_at: now_ts(),
    }
}
