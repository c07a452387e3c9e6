//! # contextloom — Context Assembly Engine
//!
//! Maintains a long-lived, queryable representation of large corpora (code,
//! conversation history, logs) and assembles bounded context bundles for a
//! generative model under strict token budgets.
//!
//! ## Architecture
//!
//! - **[`config`]** — Configuration loading, validation, defaults
//! - **[`tokenizer`]** — Per-model-family token counting (exact or heuristic)
//! - **[`db`]** — SQLite + sqlite-vec persistence: chunks, summaries,
//!   embedding index, provenance log
//! - **[`ingest`]** — Overlapping-window chunking and content-addressed storage
//! - **[`summarizer`]** — Hierarchical file/directory/project summaries
//! - **[`assembler`]** — Budgeted, deterministic context assembly
//! - **[`cache`]** / **[`session`]** — Hot-window cache and session registry
//! - **[`model`]** / **[`sandbox`]** — External model and verification boundaries
//! - **[`orchestrator`]** — Multi-pass plan → expand → verify/repair protocol
//! - **[`engine`]** — Facade consumed by the API layer

pub mod assembler;
pub mod cache;
pub mod config;
pub mod db;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod model;
pub mod orchestrator;
pub mod sandbox;
pub mod session;
pub mod summarizer;
pub mod tokenizer;

pub use engine::Engine;
pub use error::{EngineError, Result};
