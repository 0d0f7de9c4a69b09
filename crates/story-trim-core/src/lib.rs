//! # Story Trim Core
//!
//! Runtime-free logic for Story Trim: data models, content fingerprinting,
//! chapter segmentation, context levels, prompt assembly, and the store
//! abstraction with an in-memory implementation.
//!
//! This crate contains no tokio, sqlx, network, or filesystem code. The
//! `story-trim` crate layers the async services, SQLite persistence, and
//! LLM providers on top of it.

pub mod context;
pub mod fingerprint;
pub mod models;
pub mod prompt;
pub mod segment;
pub mod store;
