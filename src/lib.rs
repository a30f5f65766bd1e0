//! # Context Memory
//!
//! Bounded, access-controlled context retrieval for LLM agent prompts.
//!
//! Documents are chunked, fingerprinted, embedded, and indexed in a local
//! SQLite knowledge base. Agents then ask for context by topic under a
//! token budget, or ask questions answered by retrieval-augmented
//! generation. Every operation passes an access check and lands in an
//! audit log.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌───────────────┐   ┌──────────────┐
//! │  Ingest    │──▶│ Chunk + Embed │──▶│ SQLite index │
//! │ file / dir │   │ (fingerprint) │   │ + doc store  │
//! └────────────┘   └───────────────┘   └──────┬───────┘
//!                                             │
//!                         ┌───────────────────┤
//!                         ▼                   ▼
//!                   ┌───────────┐       ┌───────────┐
//!                   │ L1/L2     │──────▶│ Context / │
//!                   │ LRU cache │       │ QA        │
//!                   └───────────┘       └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`engine`] | The [`MemoryEngine`](engine::MemoryEngine) handle and health |
//! | [`ingest`] | `add_document`, `add_directory` |
//! | [`context`] | `get_context`, `get_context_by_domains`, `build_focused_context` |
//! | [`qa`] | Retrieval-QA, stateless and conversational |
//! | [`privacy`] | Secure delete and PII scanning |
//! | [`embedding`] | Embedding provider construction (hash, OpenAI, Ollama) |
//! | [`llm`] | Language model providers |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`stats`] | Health report rendering for the CLI |
//!
//! Pure logic (chunking, caching, access control, budgeting, PII
//! detection) lives in the `context_memory_core` crate.

pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod engine;
mod http;
pub mod ingest;
pub mod llm;
pub mod migrate;
pub mod privacy;
pub mod qa;
pub mod sqlite_store;
pub mod stats;

pub use context_memory_core::{EngineError, Result};
pub use engine::MemoryEngine;
