// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic fusion of lexical and vector result lists.
//!
//! The lexical list is walked first and owns every id it contains: on any
//! collision (same id or case-folded identical text) the lexical entry wins
//! regardless of score. Survivors are stable-sorted by score descending and
//! truncated.

use std::collections::HashSet;

use memoro_core::SearchResult;

/// Merge two ranked lists into one, preserving lexical priority on
/// collisions.
///
/// 1. Keep each unique id from the lexical list, in order.
/// 2. Drop vector entries whose id already appears or whose text equals a
///    kept entry's text after case folding.
/// 3. Stable-sort survivors by score descending.
/// 4. Truncate to `limit`.
pub fn merge_results(
    lexical: Vec<SearchResult>,
    vector: Vec<SearchResult>,
    limit: usize,
) -> Vec<SearchResult> {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut kept: Vec<SearchResult> = Vec::with_capacity(lexical.len() + vector.len());

    for result in lexical {
        if seen_ids.insert(result.entry.id.clone()) {
            kept.push(result);
        }
    }

    let kept_texts: HashSet<String> = kept
        .iter()
        .map(|r| r.entry.text.to_lowercase())
        .collect();

    for result in vector {
        if seen_ids.contains(&result.entry.id) {
            continue;
        }
        if kept_texts.contains(&result.entry.text.to_lowercase()) {
            continue;
        }
        seen_ids.insert(result.entry.id.clone());
        kept.push(result);
    }

    kept.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    kept.truncate(limit);
    kept
}
