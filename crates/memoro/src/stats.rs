// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `memoro stats` command implementation.
//!
//! Displays record counts, the decay-class breakdown and vector-store
//! residency. Falls back to plain output when stdout is not a TTY.

use std::collections::BTreeMap;
use std::io::IsTerminal;

use memoro_core::MemoroError;
use memoro_engine::MemoryEngine;
use serde::Serialize;

/// Structured stats output for `--json` mode.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: usize,
    pub expired: usize,
    pub vector_rows: usize,
    pub by_decay_class: BTreeMap<String, usize>,
}

/// Run the `memoro stats` command.
pub async fn run_stats(
    engine: &MemoryEngine,
    json: bool,
    plain: bool,
) -> Result<(), MemoroError> {
    let total = engine.lexical().count().await?;
    let expired = engine.lexical().count_expired().await?;
    let breakdown = engine.lexical().stats_breakdown().await?;
    let vector_rows = engine.vector().count().await?;

    let by_decay_class: BTreeMap<String, usize> = breakdown
        .into_iter()
        .map(|(class, n)| (class.to_string(), n))
        .collect();

    let response = StatsResponse {
        total,
        expired,
        vector_rows,
        by_decay_class,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&response).unwrap_or_else(|_| "{}".to_string())
        );
    } else {
        let use_color = !plain && std::io::stdout().is_terminal();
        print_stats(&response, use_color);
    }
    Ok(())
}

fn print_stats(response: &StatsResponse, use_color: bool) {
    println!();
    println!("  memoro stats");
    println!("  {}", "-".repeat(35));
    if use_color {
        use colored::Colorize;
        println!("    Records:  {}", response.total.to_string().green());
        println!("    Expired:  {}", response.expired.to_string().yellow());
        println!("    Vectors:  {}", response.vector_rows.to_string().green());
    } else {
        println!("    Records:  {}", response.total);
        println!("    Expired:  {}", response.expired);
        println!("    Vectors:  {}", response.vector_rows);
    }
    if !response.by_decay_class.is_empty() {
        println!();
        println!("    By decay class:");
        for (class, count) in &response.by_decay_class {
            println!("      {class:<12} {count}");
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_response_serializes() {
        let mut by_decay_class = BTreeMap::new();
        by_decay_class.insert("stable".to_string(), 4);
        by_decay_class.insert("permanent".to_string(), 2);

        let response = StatsResponse {
            total: 6,
            expired: 1,
            vector_rows: 5,
            by_decay_class,
        };
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"total\":6"));
        assert!(json.contains("\"stable\":4"));
        assert!(json.contains("\"vector_rows\":5"));
    }
}
