// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Text analysis for the memoro memory engine.
//!
//! Pure, table-driven components: query tokenization and FTS match
//! compilation, decay classification, synonym expansion, and the structured
//! extractor with its capture filter and category detector. Everything here
//! is deterministic and side-effect free; the stores and engine own all I/O.

pub mod decay;
pub mod extractor;
pub mod synonyms;
pub mod tokenize;

pub use decay::{classify_decay, expiry_for};
pub use extractor::{detect_category, extract, extract_for_category, should_capture, Extraction};
pub use synonyms::expand_tags;
pub use tokenize::{compile_match_query, tokenize};
