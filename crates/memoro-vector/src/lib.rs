// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vector memory store for the memoro engine.
//!
//! A single LanceDB table holds `(id, text, vector, importance, category,
//! created_at)` projections of lexical records. Upsert is by id, scoring is
//! `1 / (1 + distance)` over cosine distance, and batch deletes mirror the
//! lexical store's hard prune.

pub mod store;

pub use store::{VectorRecord, VectorStore, DEFAULT_DUPLICATE_THRESHOLD, DEFAULT_MIN_SCORE};
