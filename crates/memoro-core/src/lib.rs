// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core library for the memoro memory engine.
//!
//! This crate provides the shared domain types, the workspace error type, and
//! the two injected seams (clock and embedding provider) used by the lexical
//! store, vector store and engine crates.

pub mod clock;
pub mod embed;
pub mod error;
pub mod types;

// Re-export key items at crate root for ergonomic imports.
pub use clock::{Clock, FixedClock, SystemClock};
pub use embed::{cosine_similarity, vector_dims_for_model, Embedder, HashEmbedder};
pub use error::MemoroError;
pub use types::{
    is_uuid_shaped, new_memory_id, Backend, Category, CheckpointContext, DecayClass,
    MemoryCandidate, MemoryEntry, PruneReport, SearchResult, StoreOutcome, DEFAULT_IMPORTANCE,
    MIN_CONFIDENCE,
};
