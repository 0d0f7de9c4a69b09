//! LLM provider abstraction.
//!
//! [`LlmPort`] is the only way the trimming pipeline talks to a model.
//! Three call shapes are needed:
//!
//! | Method | Used by | Returns |
//! |--------|---------|---------|
//! | [`stream_chat`](LlmPort::stream_chat) | interactive trims | increments over a channel |
//! | [`structured_chat`](LlmPort::structured_chat) | batch trims | trim and summary in one reply |
//! | [`chat`](LlmPort::chat) | summaries, encyclopedia merges | plain text |
//!
//! Providers:
//! - **[`DisabledLlm`]**: every call fails; used when no provider is configured.
//! - **[`OpenAiLlm`](openai::OpenAiLlm)**: any OpenAI-compatible chat
//!   completions endpoint, with SSE streaming and retry on 429/5xx.
//!
//! Use [`create_llm`] to build the configured provider.

pub mod openai;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use story_trim_core::prompt::extract_tag;

use crate::config::LlmConfig;

/// Channel of streamed increments. Closes after the last increment or
/// after the first error.
pub type ChatStream = mpsc::Receiver<Result<String>>;

/// A trim and its summary from one call.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StructuredReply {
    pub trimmed_text: String,
    #[serde(default)]
    pub summary: String,
    /// Provider-reported token usage, when available.
    #[serde(skip)]
    pub tokens_used: Option<i64>,
}

#[async_trait]
pub trait LlmPort: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start a streaming completion. Errors before the first increment
    /// (bad credentials, unreachable host) are returned directly.
    ///
    /// Cancelling `cancel` or dropping the receiver stops the upstream
    /// request.
    async fn stream_chat(
        &self,
        system: &str,
        user: &str,
        cancel: CancellationToken,
    ) -> Result<ChatStream>;

    async fn structured_chat(
        &self,
        system: &str,
        user: &str,
        cancel: CancellationToken,
    ) -> Result<StructuredReply>;

    async fn chat(&self, system: &str, user: &str, cancel: CancellationToken) -> Result<String>;
}

pub struct DisabledLlm;

#[async_trait]
impl LlmPort for DisabledLlm {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn stream_chat(&self, _: &str, _: &str, _: CancellationToken) -> Result<ChatStream> {
        bail!("LLM provider is disabled")
    }

    async fn structured_chat(
        &self,
        _: &str,
        _: &str,
        _: CancellationToken,
    ) -> Result<StructuredReply> {
        bail!("LLM provider is disabled")
    }

    async fn chat(&self, _: &str, _: &str, _: CancellationToken) -> Result<String> {
        bail!("LLM provider is disabled")
    }
}

pub fn create_llm(config: &LlmConfig) -> Result<Arc<dyn LlmPort>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledLlm)),
        "openai" => Ok(Arc::new(openai::OpenAiLlm::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Interpret a structured reply: JSON first, then `<content>`/`<summary>`
/// tags, then the whole text as the trim with no summary.
///
/// Returns `None` when no trim text can be recovered.
pub fn parse_structured_reply(text: &str) -> Option<StructuredReply> {
    let body = strip_code_fence(text.trim());

    if let Ok(reply) = serde_json::from_str::<StructuredReply>(body) {
        if !reply.trimmed_text.trim().is_empty() {
            return Some(StructuredReply {
                trimmed_text: reply.trimmed_text.trim().to_string(),
                summary: reply.summary.trim().to_string(),
                tokens_used: None,
            });
        }
    }

    if let Some(content) = extract_tag(text, "content") {
        return Some(StructuredReply {
            trimmed_text: content,
            summary: extract_tag(text, "summary").unwrap_or_default(),
            tokens_used: None,
        });
    }

    let plain = text.trim();
    (!plain.is_empty()).then(|| StructuredReply {
        trimmed_text: plain.to_string(),
        summary: String::new(),
        tokens_used: None,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
