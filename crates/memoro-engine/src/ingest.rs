// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-level extraction from markdown notes.
//!
//! Daily notes (`YYYY-MM-DD.md`) and the long-lived `MEMORY.md` feed the
//! engine one candidate statement per line. Headers and fenced code blocks
//! are skipped, bullet markers are stripped, and every surviving line must
//! pass the capture filter before being stored with a `markdown:<stem>`
//! provenance tag.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use memoro_core::{MemoroError, MemoryCandidate, StoreOutcome};
use memoro_extract::{detect_category, should_capture};
use tracing::{debug, info};

use crate::engine::MemoryEngine;

/// Counters from an ingestion pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Files that existed and were read.
    pub files: usize,
    /// Lines stored as new memories.
    pub captured: usize,
    /// Lines dropped as duplicates of existing memories.
    pub duplicates: usize,
}

/// Streams markdown notes into the memory engine.
pub struct MarkdownIngester {
    engine: Arc<MemoryEngine>,
    notes_dir: PathBuf,
    memory_file: PathBuf,
}

impl MarkdownIngester {
    pub fn new(
        engine: Arc<MemoryEngine>,
        notes_dir: impl Into<PathBuf>,
        memory_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            notes_dir: notes_dir.into(),
            memory_file: memory_file.into(),
        }
    }

    /// Ingest the last `days` daily notes plus the designated memory file.
    pub async fn ingest_recent(&self, days: u32) -> Result<IngestReport, MemoroError> {
        let now = self.engine_clock_now();
        let mut report = IngestReport::default();

        for day_back in 0..days {
            let ts = now - i64::from(day_back) * 86_400;
            let Some(date) = DateTime::from_timestamp(ts, 0) else {
                continue;
            };
            let path = self
                .notes_dir
                .join(format!("{}.md", date.format("%Y-%m-%d")));
            self.ingest_file(&path, &mut report).await?;
        }

        self.ingest_file(&self.memory_file, &mut report).await?;

        info!(
            files = report.files,
            captured = report.captured,
            duplicates = report.duplicates,
            "markdown ingestion complete"
        );
        Ok(report)
    }

    /// Ingest one file if it exists; missing files are silently skipped.
    pub async fn ingest_file(
        &self,
        path: &Path,
        report: &mut IngestReport,
    ) -> Result<(), MemoroError> {
        let Ok(content) = tokio::fs::read_to_string(path).await else {
            debug!(path = %path.display(), "note file absent, skipping");
            return Ok(());
        };
        report.files += 1;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "notes".to_string());
        let source = format!("markdown:{stem}");

        let mut in_code_fence = false;
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("```") {
                in_code_fence = !in_code_fence;
                continue;
            }
            if in_code_fence || trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let statement = strip_bullet(trimmed);
            if !should_capture(statement) {
                continue;
            }

            let candidate = MemoryCandidate {
                category: Some(detect_category(statement)),
                source: source.clone(),
                ..MemoryCandidate::from_text(statement.to_string())
            };
            match self.engine.store(candidate).await? {
                StoreOutcome::Created { .. } => report.captured += 1,
                StoreOutcome::Duplicate => report.duplicates += 1,
            }
        }
        Ok(())
    }

    fn engine_clock_now(&self) -> i64 {
        self.engine.clock().now()
    }
}

/// Strip leading bullet and checkbox markers from a note line.
fn strip_bullet(line: &str) -> &str {
    let mut rest = line;
    for prefix in ["- [ ] ", "- [x] ", "- [X] ", "- ", "* ", "+ "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    rest.trim()
}
