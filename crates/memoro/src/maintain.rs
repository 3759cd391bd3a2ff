// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `memoro prune`, `memoro backfill-decay` and `memoro extract-daily`.

use std::path::PathBuf;
use std::sync::Arc;

use memoro_config::MemoroConfig;
use memoro_core::MemoroError;
use memoro_engine::{MarkdownIngester, MemoryEngine, PruneMode};

/// Run the `memoro prune` command.
///
/// `--hard` or `--soft` narrows to one pass; the default runs both.
/// `--dry-run` reports what a hard prune would remove without deleting.
pub async fn run_prune(
    engine: &MemoryEngine,
    hard: bool,
    soft: bool,
    dry_run: bool,
) -> Result<(), MemoroError> {
    if dry_run {
        let would_remove = engine.lexical().count_expired().await?;
        println!("dry run: {would_remove} expired record(s) would be removed");
        return Ok(());
    }

    let mode = match (hard, soft) {
        (true, false) => PruneMode::Hard,
        (false, true) => PruneMode::Soft,
        _ => PruneMode::Both,
    };
    let outcome = engine.prune(mode).await?;
    println!(
        "pruned {} record(s) ({} vector rows), decayed {} record(s)",
        outcome.hard_removed, outcome.vector_removed, outcome.soft_touched
    );
    Ok(())
}

/// Run the `memoro backfill-decay` command.
pub async fn run_backfill(engine: &MemoryEngine) -> Result<(), MemoroError> {
    let updates = engine.lexical().backfill_decay_classes().await?;
    if updates.is_empty() {
        println!("all rows already classified");
        return Ok(());
    }
    let total: usize = updates.values().sum();
    println!("reclassified {total} record(s):");
    let mut classes: Vec<_> = updates.into_iter().collect();
    classes.sort_by_key(|(class, _)| class.to_string());
    for (class, count) in classes {
        println!("  {class:<12} {count}");
    }
    Ok(())
}

/// Run the `memoro extract-daily` command.
pub async fn run_extract_daily(
    engine: &Arc<MemoryEngine>,
    config: &MemoroConfig,
    days: u32,
) -> Result<(), MemoroError> {
    let ingester = MarkdownIngester::new(
        engine.clone(),
        PathBuf::from(&config.notes.dir),
        PathBuf::from(&config.notes.memory_file),
    );
    let report = ingester.ingest_recent(days).await?;
    println!(
        "ingested {} file(s): {} captured, {} duplicate(s)",
        report.files, report.captured, report.duplicates
    );
    Ok(())
}
