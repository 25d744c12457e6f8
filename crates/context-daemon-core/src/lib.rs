//! # Context Daemon Core
//!
//! Runtime-agnostic logic for the context daemon: the context data model,
//! the [`source::ContextSource`] capability, relevance scoring, ranking and
//! byte-budget truncation, the shared context cache, per-source circuit
//! breakers, code chunking, embeddings, and the semantic chunk index.
//!
//! This crate contains no tokio, HTTP, or process-spawning code. The
//! `context-daemon` app crate wires these pieces to real sources and drives
//! them concurrently.

pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod health;
pub mod models;
pub mod rag;
pub mod rank;
pub mod score;
pub mod source;
pub mod store;

pub use error::ContextError;
pub use models::{
    BundleStatus, CacheClass, CompletionQuery, ContextBundle, ContextItem, Position, SourceId,
    SourceKind,
};
