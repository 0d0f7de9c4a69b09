//! Content fingerprinting.
//!
//! Every raw chapter body is addressed by a normalized SHA-256 digest so
//! that the same text uploaded twice (by different users, with different
//! line endings or punctuation) is stored and trimmed once.
//!
//! # Algorithm
//!
//! 1. Drop every character that is not a Unicode letter or digit.
//! 2. Lowercase what remains.
//! 3. SHA-256 the UTF-8 bytes and render lowercase hex.
//!
//! # Example
//!
//! ```rust
//! use story_trim_core::fingerprint::fingerprint;
//!
//! assert_eq!(fingerprint("Hello, World!"), fingerprint("hello world"));
//! ```

use sha2::{Digest, Sha256};

use crate::models::{ContentFingerprint, RawContent};

/// Approximate characters-per-token ratio used for cost estimates.
const CHARS_PER_TOKEN: i64 = 4;

/// Strip everything except letters and digits, then lowercase.
pub fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Compute the content fingerprint of `text`.
///
/// Empty or punctuation-only input yields the digest of the empty string;
/// use [`is_blank`] to recognize it.
pub fn fingerprint(text: &str) -> ContentFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize_text(text).as_bytes());
    ContentFingerprint::from_hex(format!("{:x}", hasher.finalize()))
}

/// True when `fp` addresses text with no letters or digits. Such chapters
/// have nothing to trim.
pub fn is_blank(fp: &ContentFingerprint) -> bool {
    *fp == fingerprint("")
}

/// Number of Unicode scalar values in `text`. All length math uses this.
pub fn char_count(text: &str) -> i64 {
    text.chars().count() as i64
}

pub fn estimate_tokens(char_count: i64) -> i64 {
    (char_count + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN
}

/// Build the [`RawContent`] row for `text` with derived metrics.
pub fn raw_content(text: &str, now: i64) -> RawContent {
    let chars = char_count(text);
    RawContent {
        fingerprint: fingerprint(text),
        text: text.to_string(),
        char_count: chars,
        token_estimate: estimate_tokens(chars),
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punctuation_case_whitespace_insensitive() {
        assert_eq!(fingerprint("Hello, World!"), fingerprint("hello world"));
        assert_eq!(fingerprint("a\r\nb\tc"), fingerprint("ABC"));
    }

    #[test]
    fn test_cjk_punctuation_is_stripped() {
        assert_eq!(fingerprint("你好，世界。"), fingerprint("你好世界"));
    }

    #[test]
    fn test_different_text_differs() {
        assert_ne!(fingerprint("chapter one"), fingerprint("chapter two"));
    }

    #[test]
    fn test_empty_and_blank_share_digest() {
        let empty = fingerprint("");
        assert_eq!(fingerprint("   \n\t "), empty);
        assert_eq!(fingerprint("...!?"), empty);
        assert_eq!(
            empty.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(is_blank(&fingerprint("* * *")));
        assert!(!is_blank(&fingerprint("a")));
    }

    #[test]
    fn test_fixed_length_hex() {
        let fp = fingerprint("Some chapter body");
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_raw_content_metrics() {
        let raw = raw_content("第一章 开始", 0);
        assert_eq!(raw.char_count, 6);
        assert_eq!(raw.token_estimate, 2);
        assert_eq!(raw.fingerprint, fingerprint("第一章开始"));
    }
}
