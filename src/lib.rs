//! # Context Daemon
//!
//! A local daemon that assembles context for code completion. Given a file
//! and cursor position it queries every enabled source concurrently, keeps
//! whatever arrives before the deadline, ranks it, and returns a bundle that
//! fits the configured byte budget.
//!
//! ## Architecture
//!
//! ```text
//!   editor ──HTTP──▶ ┌──────────┐   per-source tasks    ┌────────────────┐
//!                    │ gatherer │ ─────────────────────▶│ buffer         │
//!                    │          │  cache ▸ breaker ▸    │ mcp:<server>   │
//!                    │          │  fetch (timeout)      │ semantic index │
//!                    └────┬─────┘                       └───────┬────────┘
//!                         │ rank + truncate                     │
//!                         ▼                                     ▼
//!                   ContextBundle                  background indexer
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`daemon`] | Process-wide state, notifications, shutdown |
//! | [`gather`] | Concurrent, deadline-bound context gathering |
//! | [`source_buffer`] | Open buffers, sibling files, current-file reads |
//! | [`source_resource`] | Resource-server adapter |
//! | [`mcp`] | Stdio resource-protocol client (`rmcp`) |
//! | [`import`] | Server definitions from `mcpServers` JSON files |
//! | [`inspect`] | Server inspection commands |
//! | [`paths`] | Canonical path keys for editor-supplied paths |
//! | [`source_semantic`] | Semantic index source |
//! | [`indexer`] | Background workspace indexing |
//! | [`embedding`] | Embedding provider construction |
//! | [`server`] | HTTP API |
//! | [`sources`] | Source listings |
//!
//! Source-independent logic (models, ranking, cache, breakers, chunking,
//! the chunk index) lives in `context-daemon-core`.

pub mod config;
pub mod daemon;
pub mod embedding;
pub mod gather;
pub mod import;
pub mod indexer;
pub mod inspect;
pub mod mcp;
pub mod paths;
pub mod server;
pub mod source_buffer;
pub mod source_resource;
pub mod source_semantic;
pub mod sources;
