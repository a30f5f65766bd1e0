//! # Context Memory Core
//!
//! Runtime-free logic for Context Memory: data models, chunking and
//! fingerprinting, the embedding trait with an offline hashing embedder,
//! the store abstraction with an in-memory backend, the tiered cache,
//! access control, token budgeting, PII detection, and the profiler.
//!
//! This crate has no tokio, sqlx, HTTP or filesystem dependencies. The
//! `context-memory` crate wires these pieces into the engine.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`access`] | Roles, permissions, audit log, input sanitizing |
//! | [`budget`] | Token estimation and context assembly |
//! | [`cache`] | Two-tier LRU cache |
//! | [`chunk`] | Fixed, semantic and adaptive chunking |
//! | [`embedding`] | Embedding trait, hashing embedder, vector helpers |
//! | [`error`] | [`EngineError`](error::EngineError) |
//! | [`models`] | Documents, chunks, index entries, filters |
//! | [`pii`] | Email, SSN and card detectors |
//! | [`profiler`] | Per-operation timing |
//! | [`store`] | `Store` trait and `InMemoryStore` |

pub mod access;
pub mod budget;
pub mod cache;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod pii;
pub mod profiler;
pub mod store;

pub use error::{EngineError, Result};
