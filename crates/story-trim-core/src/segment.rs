//! Chapter boundary detection by rule racing.
//!
//! Novels arrive as plain text with no markup, so chapter breaks have to be
//! inferred from heading lines. Several candidate heading patterns are run
//! against the whole document and each is scored on how plausible its
//! split would be; the best one wins.
//!
//! # Scoring
//!
//! For a rule with `n` matches:
//!
//! 1. Candidate chapter lengths are the distances between consecutive
//!    match starts (the last chapter runs to the end of the document).
//! 2. If the mean length is below [`MIN_MEAN_CHAPTER_CHARS`] the rule is
//!    rejected; it is matching incidental lines, not headings.
//! 3. `cv = stddev / mean` measures how uneven the chapters are.
//! 4. `score = weight + min(n × 0.1, 50) − cv × 50`.
//!
//! Lengths are counted in characters, not bytes, so CJK and Latin text
//! are scored on the same scale.
//!
//! # Example
//!
//! ```rust
//! use story_trim_core::segment::{default_rules, segment};
//!
//! let body = "It was a quiet morning in the village. ".repeat(10);
//! let text = format!("Chapter 1 Dawn\n{body}\nChapter 2 Dusk\n{body}");
//! let seg = segment(&text, &default_rules());
//! assert_eq!(seg.chapters.len(), 2);
//! assert_eq!(seg.rule.as_deref(), Some("strict_english"));
//! assert_eq!(seg.chapters[1].title, "Chapter 2 Dusk");
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Mean chapter length below which a rule is rejected outright.
pub const MIN_MEAN_CHAPTER_CHARS: f64 = 200.0;
/// Score given to rejected rules.
pub const REJECTED_SCORE: f64 = -10_000.0;
const BONUS_PER_MATCH: f64 = 0.1;
const BONUS_CAP: f64 = 50.0;
const UNIFORMITY_PENALTY: f64 = 50.0;

/// Title used when no rule produces a usable split.
pub const FALLBACK_TITLE: &str = "Full Text";

/// A heading pattern with a base weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Regex matched against whole heading lines; use `(?m)^` anchoring.
    pub pattern: String,
    pub weight: i32,
}

impl Rule {
    pub fn new(name: &str, pattern: &str, weight: i32) -> Self {
        Self {
            name: name.to_string(),
            pattern: pattern.to_string(),
            weight,
        }
    }
}

/// Built-in rules, most specific first.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "strict_cjk",
            r"(?m)^第[0-9零一二三四五六七八九十百千万两]+[章回节][ \t].*",
            100,
        ),
        Rule::new(
            "cjk",
            r"(?m)^第[0-9零一二三四五六七八九十百千万两]+[章回节].*",
            90,
        ),
        Rule::new("strict_english", r"(?mi)^chapter[ \t]+[0-9]+.*", 80),
        Rule::new(
            "english_words",
            r"(?mi)^chapter[ \t]+[a-z\-]+[ \t\r]*$",
            70,
        ),
        Rule::new("numbered", r"(?m)^[0-9]+\.[ \t]+.*", 60),
        Rule::new(
            "bare_ordinal",
            r"(?m)^[0-9零一二三四五六七八九十百千万]+[ \t]+.*",
            40,
        ),
    ]
}

/// One detected chapter. `start`/`end` are byte offsets into the source,
/// spanning from the heading to the next heading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentedChapter {
    pub index: usize,
    pub title: String,
    pub body: String,
    pub start: usize,
    pub end: usize,
}

/// Result of [`segment`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segmentation {
    pub chapters: Vec<SegmentedChapter>,
    /// Name of the winning rule; `None` when the fallback was used.
    pub rule: Option<String>,
    /// Non-blank text before the first heading, if any.
    pub preface: Option<String>,
}

/// Per-rule diagnostics from [`evaluate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleReport {
    pub name: String,
    pub matches: usize,
    /// `None` when the rule matched nothing or its pattern did not compile.
    pub score: Option<f64>,
}

struct Candidate<'r> {
    rule: &'r Rule,
    spans: Vec<(usize, usize)>,
    score: f64,
}

/// Split `text` into chapters using the best-scoring rule in `rules`.
///
/// Pure and deterministic: the same text and rule set always produce the
/// same result. Ties go to the earlier rule.
pub fn segment(text: &str, rules: &[Rule]) -> Segmentation {
    let mut best: Option<Candidate> = None;

    for candidate in race(text, rules) {
        if candidate.score <= REJECTED_SCORE {
            continue;
        }
        let better = match &best {
            Some(b) => candidate.score > b.score,
            None => true,
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some(winner) => Segmentation {
            preface: preface(text, winner.spans[0].0),
            chapters: extract_chapters(text, &winner.spans),
            rule: Some(winner.rule.name.clone()),
        },
        None => Segmentation {
            chapters: vec![SegmentedChapter {
                index: 0,
                title: FALLBACK_TITLE.to_string(),
                body: text.to_string(),
                start: 0,
                end: text.len(),
            }],
            rule: None,
            preface: None,
        },
    }
}

/// Score every rule without extracting chapters.
pub fn evaluate(text: &str, rules: &[Rule]) -> Vec<RuleReport> {
    let scored = race(text, rules);
    rules
        .iter()
        .map(|rule| match scored.iter().find(|c| std::ptr::eq(c.rule, rule)) {
            Some(c) => RuleReport {
                name: rule.name.clone(),
                matches: c.spans.len(),
                score: Some(c.score),
            },
            None => RuleReport {
                name: rule.name.clone(),
                matches: 0,
                score: None,
            },
        })
        .collect()
}

/// Run every compilable rule that matches at least once and score it.
fn race<'r>(text: &str, rules: &'r [Rule]) -> Vec<Candidate<'r>> {
    let total_chars = text.chars().count();
    let mut out = Vec::new();

    for rule in rules {
        let re = match Regex::new(&rule.pattern) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!(rule = %rule.name, error = %e, "skipping segmentation rule with invalid pattern");
                continue;
            }
        };
        let spans: Vec<(usize, usize)> = re
            .find_iter(text)
            .filter(|m| !m.as_str().trim().is_empty())
            .map(|m| (m.start(), m.end()))
            .collect();
        if spans.is_empty() {
            continue;
        }
        let starts = char_offsets(text, &spans);
        let score = score_rule(total_chars, &starts, rule.weight);
        tracing::debug!(rule = %rule.name, matches = spans.len(), score, "segmentation rule scored");
        out.push(Candidate { rule, spans, score });
    }

    out
}

/// Convert ascending byte offsets of span starts into character offsets.
fn char_offsets(text: &str, spans: &[(usize, usize)]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(spans.len());
    let mut last_byte = 0;
    let mut last_char = 0;
    for &(start, _) in spans {
        last_char += text[last_byte..start].chars().count();
        last_byte = start;
        offsets.push(last_char);
    }
    offsets
}

/// Fitness of a rule given the character offsets of its matches.
pub fn score_rule(total_chars: usize, starts: &[usize], weight: i32) -> f64 {
    let count = starts.len();
    if count == 0 {
        return REJECTED_SCORE;
    }

    let lengths: Vec<f64> = starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let next = starts.get(i + 1).copied().unwrap_or(total_chars);
            (next - start) as f64
        })
        .collect();

    let mean = lengths.iter().sum::<f64>() / count as f64;
    if mean < MIN_MEAN_CHAPTER_CHARS {
        return REJECTED_SCORE;
    }

    let variance = lengths.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / count as f64;
    let cv = variance.sqrt() / mean;

    let bonus = (count as f64 * BONUS_PER_MATCH).min(BONUS_CAP);
    weight as f64 + bonus - cv * UNIFORMITY_PENALTY
}

fn extract_chapters(text: &str, spans: &[(usize, usize)]) -> Vec<SegmentedChapter> {
    spans
        .iter()
        .enumerate()
        .map(|(i, &(start, heading_end))| {
            let end = spans.get(i + 1).map(|s| s.0).unwrap_or(text.len());
            SegmentedChapter {
                index: i,
                title: text[start..heading_end].trim().to_string(),
                body: text[heading_end..end].trim().to_string(),
                start,
                end,
            }
        })
        .collect()
}

fn preface(text: &str, first_start: usize) -> Option<String> {
    let head = text[..first_start].trim();
    (!head.is_empty()).then(|| head.to_string())
}
