//! Progressive memory: chapter summaries rolling up into an encyclopedia.
//!
//! Memory is scoped by the book fingerprint (the first chapter's content
//! fingerprint), so two users uploading the same novel share it.
//!
//! - After a chapter is trimmed interactively, a [`SummaryJob`] on the
//!   background pool writes a 200–400 character synopsis for it.
//! - Every `encyclopedia_interval` chapters, the recent summaries are
//!   merged with the previous encyclopedia into a new entry
//!   ([`ProgressiveMemory::rollup`]). Entries are append-only.
//! - [`ProgressiveMemory::get_context`] returns what a trim of chapter `i`
//!   may see: recent summaries before `i` and the latest encyclopedia
//!   ending before `i`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use story_trim_core::context::{ContextLevel, MemoryContext};
use story_trim_core::models::{now_ts, ChapterSummary, ContentFingerprint, Encyclopedia, PromptKind};
use story_trim_core::prompt::{
    build_encyclopedia_input, build_summary_system_prompt, DEFAULT_SUMMARY_INSTRUCTION,
    ENCYCLOPEDIA_POLICY,
};
use story_trim_core::store::Stores;

use crate::config::MemoryConfig;
use crate::llm::LlmPort;
use crate::worker::Job;

pub struct ProgressiveMemory {
    stores: Stores,
    llm: Arc<dyn LlmPort>,
    summary_limit: usize,
    encyclopedia_interval: usize,
}

impl ProgressiveMemory {
    pub fn new(stores: Stores, llm: Arc<dyn LlmPort>, config: &MemoryConfig) -> Self {
        Self {
            stores,
            llm,
            summary_limit: config.summary_limit.max(1),
            encyclopedia_interval: config.encyclopedia_interval.max(1),
        }
    }

    pub fn summary_limit(&self) -> usize {
        self.summary_limit
    }

    pub fn encyclopedia_interval(&self) -> usize {
        self.encyclopedia_interval
    }

    /// Whether finishing chapter `index` should trigger a rollup.
    pub fn is_rollup_point(&self, index: i64) -> bool {
        (index + 1) % self.encyclopedia_interval as i64 == 0
    }

    pub async fn get_context(
        &self,
        book_fp: &ContentFingerprint,
        before_index: i64,
    ) -> Result<MemoryContext> {
        let summaries = self
            .stores
            .memory
            .recent_summaries(book_fp, before_index, self.summary_limit)
            .await?;
        let encyclopedia = self
            .stores
            .memory
            .latest_encyclopedia(book_fp, before_index)
            .await?;
        Ok(MemoryContext {
            summaries,
            encyclopedia,
        })
    }

    pub fn level_of(&self, context: &MemoryContext) -> ContextLevel {
        context.level(self.summary_limit)
    }

    /// Instructions for summaries: the default summary prompt, or the
    /// built-in text when none is configured.
    pub async fn summary_instruction(&self) -> Result<String> {
        Ok(self
            .stores
            .prompts
            .default_prompt(PromptKind::Summary)
            .await?
            .map(|p| p.template)
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SUMMARY_INSTRUCTION.to_string()))
    }

    pub async fn save_summary(
        &self,
        book_fp: &ContentFingerprint,
        chapter_index: i64,
        chapter_fp: &ContentFingerprint,
        content: &str,
    ) -> Result<()> {
        self.stores
            .memory
            .upsert_summary(&ChapterSummary {
                book_fingerprint: book_fp.clone(),
                chapter_index,
                chapter_fingerprint: chapter_fp.clone(),
                content: content.trim().to_string(),
                created_at: now_ts(),
            })
            .await
    }

    /// Ask the model for a synopsis of `text` and store it at
    /// `(book_fp, chapter_index)`, replacing any previous one.
    pub async fn generate_summary(
        &self,
        book_fp: &ContentFingerprint,
        chapter_index: i64,
        chapter_fp: &ContentFingerprint,
        text: &str,
        cancel: CancellationToken,
    ) -> Result<()> {
        let system = build_summary_system_prompt(&self.summary_instruction().await?);
        let summary = self.llm.chat(&system, text, cancel).await?;
        if summary.trim().is_empty() {
            anyhow::bail!("model returned an empty summary");
        }
        self.save_summary(book_fp, chapter_index, chapter_fp, &summary)
            .await?;
        tracing::debug!(book_fp = %book_fp, chapter_index, "chapter summary stored");
        Ok(())
    }

    /// Merge recent summaries up to `range_end` into a new encyclopedia
    /// entry. Returns `true` when an entry was written.
    ///
    /// Skips when an entry for `range_end` exists or there are no
    /// summaries to merge.
    pub async fn rollup(
        &self,
        book_fp: &ContentFingerprint,
        range_end: i64,
        cancel: CancellationToken,
    ) -> Result<bool> {
        let memory = &self.stores.memory;
        if memory.get_encyclopedia(book_fp, range_end).await?.is_some() {
            return Ok(false);
        }

        let summaries = memory
            .recent_summaries(book_fp, range_end + 1, self.encyclopedia_interval)
            .await?;
        if summaries.is_empty() {
            tracing::debug!(book_fp = %book_fp, range_end, "no summaries to roll up");
            return Ok(false);
        }

        let prior = memory.latest_encyclopedia(book_fp, range_end).await?;
        let input = build_encyclopedia_input(prior.as_ref(), &summaries);
        let content = self.llm.chat(ENCYCLOPEDIA_POLICY, &input, cancel).await?;
        if content.trim().is_empty() {
            anyhow::bail!("model returned an empty encyclopedia");
        }

        let written = memory
            .append_encyclopedia(&Encyclopedia {
                book_fingerprint: book_fp.clone(),
                range_end,
                content: content.trim().to_string(),
                created_at: now_ts(),
            })
            .await?;
        if written {
            tracing::info!(book_fp = %book_fp, range_end, summaries = summaries.len(), "encyclopedia updated");
        }
        Ok(written)
    }
}

/// Background summary for one chapter, followed by a rollup when the
/// chapter closes an encyclopedia interval.
pub struct SummaryJob {
    pub memory: Arc<ProgressiveMemory>,
    pub book_fp: ContentFingerprint,
    pub chapter_index: i64,
    pub chapter_fp: ContentFingerprint,
    pub text: String,
}

#[async_trait]
impl Job for SummaryJob {
    fn name(&self) -> &'static str {
        "chapter_summary"
    }

    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        self.memory
            .generate_summary(
                &self.book_fp,
                self.chapter_index,
                &self.chapter_fp,
                &self.text,
                cancel.clone(),
            )
            .await?;

        if self.memory.is_rollup_point(self.chapter_index) {
            self.memory
                .rollup(&self.book_fp, self.chapter_index, cancel)
                .await?;
        }
        Ok(())
    }
}
