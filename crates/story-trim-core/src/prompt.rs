//! Prompt assembly, ratio math, and reply parsing.
//!
//! The system prompt sent for a trim is built from four parts:
//!
//! 1. A fixed editing policy ([`TRIM_POLICY`]).
//! 2. An absolute length window: the prompt's boundary ratios applied to
//!    the raw chapter's character count, plus the target percentage.
//! 3. The prompt's own instructions (`template`).
//! 4. Progressive memory: the latest encyclopedia and recent summaries.
//!
//! Batch trims additionally ask for a chapter summary in the same call
//! and request a JSON reply; [`extract_tag`] handles models that answer
//! with `<content>`/`<summary>` tags instead.

use crate::context::MemoryContext;
use crate::models::{ChapterSummary, Encyclopedia, Prompt};

pub const TRIM_POLICY: &str = "You are a careful fiction editor. Rewrite the chapter the user \
provides into a condensed version that keeps every plot event and character decision. Keep \
all dialogue in full: never paraphrase, shorten, or cut a spoken line. Remove repetition, \
padding, and digressions from the narration. Keep the original narrative voice, tense, and \
point of view. Never add events, never summarize in the third person about the text, and never \
comment on your own edits. Output only the rewritten chapter text.";

pub const DEFAULT_SUMMARY_INSTRUCTION: &str =
    "Write a synopsis of this chapter in 200 to 400 characters covering the main events, \
the characters involved, and any new setting details.";

pub const SUMMARY_POLICY: &str = "You summarize chapters of serialized fiction for a reader \
who will continue the story later. Output only the synopsis, with no heading or preamble.";

pub const ENCYCLOPEDIA_POLICY: &str = "You maintain a setting encyclopedia for a serialized \
novel. Merge the previous encyclopedia with the latest chapter summaries into a single updated \
Markdown document covering characters, relationships, places, factions, items, and open plot \
threads. Drop details that were superseded. Output only the document.";

const NONE_MARKER: &str = "(none)";

/// Rounded ratio of trimmed to raw length, to four decimal places.
///
/// A zero-length raw text yields `0.0`.
pub fn compression_ratio(trimmed_chars: i64, raw_chars: i64) -> f64 {
    if raw_chars <= 0 {
        return 0.0;
    }
    let rate = trimmed_chars as f64 / raw_chars as f64;
    (rate * 10_000.0 + 0.5).floor() / 10_000.0
}

/// Absolute character window implied by the prompt's boundary ratios.
pub fn length_window(prompt: &Prompt, raw_chars: i64) -> (i64, i64) {
    let raw = raw_chars as f64;
    (
        (raw * prompt.boundary_min()) as i64,
        (raw * prompt.boundary_max()) as i64,
    )
}

/// Target retention as a percentage label, e.g. `"50-60"` or `"50"`.
pub fn target_percent(prompt: &Prompt) -> String {
    let min = (prompt.target_ratio_min * 100.0).round() as i64;
    let max = (prompt.target_ratio_max * 100.0).round() as i64;
    if min == max {
        min.to_string()
    } else {
        format!("{min}-{max}")
    }
}

fn format_summaries(summaries: &[ChapterSummary]) -> String {
    if summaries.is_empty() {
        return NONE_MARKER.to_string();
    }
    summaries
        .iter()
        .map(|s| format!("- Chapter {}: {}", s.chapter_index + 1, s.content.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn format_encyclopedia(enc: Option<&Encyclopedia>) -> &str {
    enc.map(|e| e.content.trim()).unwrap_or(NONE_MARKER)
}

fn trim_body(prompt: &Prompt, raw_chars: i64, memory: &MemoryContext) -> String {
    let (min, max) = length_window(prompt, raw_chars);
    let mut out = String::new();
    out.push_str(TRIM_POLICY);
    out.push_str("\n\n## Length\n");
    out.push_str(&format!(
        "The original chapter has {raw_chars} characters. The rewrite must be between {min} and \
{max} characters, aiming to keep about {}% of the original.\n",
        target_percent(prompt)
    ));
    if !prompt.template.trim().is_empty() {
        out.push_str("\n## Style\n");
        out.push_str(prompt.template.trim());
        out.push('\n');
    }
    out.push_str("\n## Story so far\n### Encyclopedia\n");
    out.push_str(format_encyclopedia(memory.encyclopedia.as_ref()));
    out.push_str("\n### Recent chapters\n");
    out.push_str(&format_summaries(&memory.summaries));
    out.push('\n');
    out
}

/// System prompt for a single streaming trim.
pub fn build_trim_system_prompt(prompt: &Prompt, raw_chars: i64, memory: &MemoryContext) -> String {
    trim_body(prompt, raw_chars, memory)
}

/// System prompt for a batch trim that also returns a chapter summary.
pub fn build_batch_system_prompt(
    prompt: &Prompt,
    summary_instruction: &str,
    raw_chars: i64,
    memory: &MemoryContext,
) -> String {
    let mut out = trim_body(prompt, raw_chars, memory);
    out.push_str("\n## Summary\n");
    out.push_str(summary_instruction.trim());
    out.push_str(
        "\n\n## Output format\nReply with a JSON object with two string fields: \
\"trimmed_text\" holding the rewritten chapter and \"summary\" holding the synopsis. \
If you cannot produce JSON, wrap the rewrite in <content></content> and the synopsis in \
<summary></summary>.\n",
    );
    out
}

pub fn build_summary_system_prompt(instruction: &str) -> String {
    format!("{SUMMARY_POLICY}\n\n{}", instruction.trim())
}

/// User message for an encyclopedia merge.
pub fn build_encyclopedia_input(prior: Option<&Encyclopedia>, summaries: &[ChapterSummary]) -> String {
    format!(
        "[Previous encyclopedia]\n{}\n\n[Latest chapter summaries]\n{}",
        format_encyclopedia(prior),
        format_summaries(summaries)
    )
}

/// Split `text` into consecutive slices of at most `size` characters.
///
/// Concatenating the slices yields `text` exactly. `size` of zero is
/// treated as one.
pub fn replay_slices(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Content between the first `<tag>` and the last `</tag>`, trimmed.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text.rfind(&close)?;
    if start > end {
        return None;
    }
    let inner = text[start..end].trim();
    (!inner.is_empty()).then(|| inner.to_string())
}
