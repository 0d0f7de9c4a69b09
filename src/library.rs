//! Book import, readiness, and removal.

use serde::Serialize;

use story_trim_core::fingerprint::{fingerprint, raw_content};
use story_trim_core::models::{now_ts, Book, NewBook, NewChapter, UserContext};
use story_trim_core::segment::{segment, Rule};
use story_trim_core::store::Stores;

use crate::config::TrimConfig;
use crate::error::{ServiceResult, TrimError};

/// Title given to text found before the first chapter heading.
pub const PREFACE_TITLE: &str = "Preface";

pub struct Library {
    stores: Stores,
    rules: Vec<Rule>,
    readiness_threshold: f64,
    readiness_tolerance: i64,
}

/// How much of a book a user has trimmed under one prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookTrimStatus {
    pub book_id: i64,
    pub prompt_id: i64,
    pub total_chapters: i64,
    pub processed_chapters: i64,
    /// Chapters needed before the book counts as ready.
    pub required_chapters: i64,
    pub ready: bool,
}

/// Minimum processed chapters for a book of `total` chapters to be ready:
/// `max(1, ceil(total × threshold) − tolerance)`.
pub fn required_chapters(total: i64, threshold: f64, tolerance: i64) -> i64 {
    let needed = (total as f64 * threshold).ceil() as i64 - tolerance;
    needed.max(1)
}

impl Library {
    pub fn new(stores: Stores, rules: Vec<Rule>, config: &TrimConfig) -> Self {
        Self {
            stores,
            rules,
            readiness_threshold: config.readiness_threshold,
            readiness_tolerance: config.readiness_tolerance,
        }
    }

    /// Segment `text`, store every chapter body by fingerprint, and create
    /// the book. A non-blank preface becomes chapter 0.
    pub async fn import_book(
        &self,
        user: UserContext,
        title: &str,
        text: &str,
    ) -> ServiceResult<Book> {
        if text.trim().is_empty() {
            return Err(TrimError::InvalidInput("book text is empty".to_string()));
        }
        let title = title.trim();
        if title.is_empty() {
            return Err(TrimError::InvalidInput("book title is empty".to_string()));
        }

        let seg = segment(text, &self.rules);
        let mut bodies: Vec<(String, String)> = Vec::with_capacity(seg.chapters.len() + 1);
        if let Some(preface) = seg.preface {
            bodies.push((PREFACE_TITLE.to_string(), preface));
        }
        bodies.extend(seg.chapters.into_iter().map(|c| (c.title, c.body)));

        if bodies.iter().all(|(_, body)| body.trim().is_empty()) {
            return Err(TrimError::InvalidInput(
                "every chapter of the book is empty".to_string(),
            ));
        }

        let now = now_ts();
        let mut chapters = Vec::with_capacity(bodies.len());
        for (index, (chapter_title, body)) in bodies.into_iter().enumerate() {
            let raw = raw_content(&body, now);
            self.stores.content.save_raw_content(&raw).await?;
            chapters.push(NewChapter {
                index: index as i64,
                title: chapter_title,
                fingerprint: raw.fingerprint,
            });
        }

        let book_fingerprint = chapters[0].fingerprint.clone();
        let book = self
            .stores
            .content
            .create_book(
                &NewBook {
                    user_id: user.user_id,
                    title: title.to_string(),
                    content_fingerprint: fingerprint(text),
                    book_fingerprint,
                    total_chapters: chapters.len() as i64,
                },
                &chapters,
            )
            .await?;

        tracing::info!(
            book_id = book.id,
            chapters = book.total_chapters,
            rule = seg.rule.as_deref().unwrap_or("none"),
            "book imported"
        );
        Ok(book)
    }

    pub async fn book_trim_status(
        &self,
        user: UserContext,
        book_id: i64,
        prompt_id: i64,
    ) -> ServiceResult<BookTrimStatus> {
        let book = self
            .stores
            .content
            .get_book(book_id)
            .await?
            .ok_or_else(|| TrimError::not_found("book", book_id))?;

        let processed = match user.user_id {
            Some(uid) => {
                self.stores
                    .cache
                    .count_footprints(uid, book_id, prompt_id)
                    .await?
            }
            None => 0,
        };
        let required = required_chapters(
            book.total_chapters,
            self.readiness_threshold,
            self.readiness_tolerance,
        );

        Ok(BookTrimStatus {
            book_id,
            prompt_id,
            total_chapters: book.total_chapters,
            processed_chapters: processed,
            required_chapters: required,
            ready: processed >= required,
        })
    }

    pub async fn delete_book(&self, book_id: i64) -> ServiceResult<()> {
        if !self.stores.content.delete_book(book_id).await? {
            return Err(TrimError::not_found("book", book_id));
        }
        tracing::info!(book_id, "book deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_chapters() {
        assert_eq!(required_chapters(10, 0.9, 1), 8);
        assert_eq!(required_chapters(100, 0.9, 1), 89);
        assert_eq!(required_chapters(1, 0.9, 1), 1);
        assert_eq!(required_chapters(0, 0.9, 1), 1);
        assert_eq!(required_chapters(3, 1.0, 0), 3);
    }
}
