// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `memoro search` and `memoro lookup` command implementations.

use memoro_core::{MemoroError, SearchResult};
use memoro_engine::MemoryEngine;

/// Run the `memoro search` command: hybrid recall over both indexes.
pub async fn run_search(
    engine: &MemoryEngine,
    query: &str,
    limit: usize,
) -> Result<(), MemoroError> {
    let results = engine.recall(query, limit, None).await?;
    print_results(&results);
    Ok(())
}

/// Run the `memoro lookup` command: direct case-insensitive entity lookup.
pub async fn run_lookup(
    engine: &MemoryEngine,
    entity: &str,
    key: Option<&str>,
) -> Result<(), MemoroError> {
    let results = engine.lexical().lookup(entity, key).await?;
    print_results(&results);
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("no matches");
        return;
    }
    for result in results {
        let identity = match (&result.entry.entity, &result.entry.key) {
            (Some(entity), Some(key)) => format!(" ({entity}/{key})"),
            (Some(entity), None) => format!(" ({entity})"),
            _ => String::new(),
        };
        println!(
            "{:.3}  [{}] {}{}  {}",
            result.score,
            result.entry.category,
            result.entry.id,
            identity,
            result.entry.text,
        );
    }
}
