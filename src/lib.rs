//! # Story Trim
//!
//! Chapter-level condensation of long-form fiction with an LLM.
//!
//! A book is imported as plain text, split into chapters by scored heading
//! rules, and stored by content fingerprint. Each chapter can then be
//! trimmed on demand (streamed to the reader) or as part of a whole-book
//! batch. Trims are cached per `(fingerprint, prompt, version, context
//! level)`, and every trim also feeds a progressive memory of chapter
//! summaries and periodic encyclopedia rollups, which later chapters see as
//! context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐
//! │ Library  │──▶│ Segment  │──▶│ Content store │
//! └──────────┘   └──────────┘   └──────┬───────┘
//!                                      │
//!            ┌─────────────────────────┤
//!            ▼                         ▼
//!     ┌──────────────┐          ┌─────────────┐
//!     │ StreamTrimmer│          │ BatchEngine │
//!     └──────┬───────┘          └──────┬──────┘
//!            └──────────┬──────────────┘
//!                       ▼
//!               ┌──────────────┐   ┌──────────────────┐
//!               │  TrimCache   │──▶│ ProgressiveMemory│
//!               └──────┬───────┘   └──────────────────┘
//!                      ▼
//!                 ┌─────────┐
//!                 │ LlmPort │
//!                 └─────────┘
//! ```
//!
//! Pure logic (segmentation, fingerprints, context levels, prompt assembly)
//! and the storage traits live in the `story-trim-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`app`] | Service wiring and lifecycle |
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | SQLite implementation of the storage traits |
//! | [`llm`] | Chat provider abstraction |
//! | [`worker`] | Bounded worker pools |
//! | [`memory`] | Summaries and encyclopedia rollups |
//! | [`cache`] | Quality-tiered trim cache |
//! | [`stream`] | Streaming trims |
//! | [`batch`] | Whole-book batch trims |
//! | [`library`] | Book import and readiness |
//! | [`progress`] | CLI progress reporting |

pub mod app;
pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod library;
pub mod llm;
pub mod memory;
pub mod migrate;
pub mod progress;
pub mod sqlite_store;
pub mod stream;
pub mod worker;
