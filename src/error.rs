//! Error type of the public service surface.
//!
//! Stores and internals return `anyhow::Result`; the operations exposed
//! to callers ([`stream_trim`](crate::stream::StreamTrimmer::stream_trim),
//! [`submit_batch`](crate::batch::BatchEngine::submit_batch), and friends)
//! convert into [`TrimError`] so callers can branch on the kind.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrimError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{0} not found")]
    NotFound(String),

    /// The LLM provider failed or returned nothing usable.
    #[error("llm error: {0}")]
    Llm(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl TrimError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        TrimError::NotFound(format!("{what} {id}"))
    }

    pub fn llm(err: impl std::fmt::Display) -> Self {
        TrimError::Llm(err.to_string())
    }
}

pub type ServiceResult<T> = std::result::Result<T, TrimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(TrimError::not_found("chapter", 42).to_string(), "chapter 42 not found");
        assert_eq!(TrimError::Cancelled.to_string(), "cancelled");
        let storage: TrimError = anyhow::anyhow!("disk full").into();
        assert_eq!(storage.to_string(), "disk full");
    }
}
