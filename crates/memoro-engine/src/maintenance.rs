// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduled maintenance: startup sweep and the periodic prune/decay tick.
//!
//! The tick competes for the same writer as user operations and holds no
//! external lock; every pass scans fixed predicates inside bounded
//! transactions, so a tick always finishes well within its period. Vector
//! deletions that fail are retried naturally on the next tick because the
//! lexical store stays authoritative for residency.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::engine::{MemoryEngine, PruneMode, PruneOutcome};
use crate::ingest::{IngestReport, MarkdownIngester};

/// Drives the engine's periodic upkeep.
pub struct MaintenanceRunner {
    engine: Arc<MemoryEngine>,
    ingester: Option<MarkdownIngester>,
    interval: Duration,
    markdown_days: u32,
}

impl MaintenanceRunner {
    pub fn new(
        engine: Arc<MemoryEngine>,
        ingester: Option<MarkdownIngester>,
        interval: Duration,
        markdown_days: u32,
    ) -> Self {
        Self {
            engine,
            ingester,
            interval,
            markdown_days,
        }
    }

    /// Startup sweep: hard-prune (mirroring the vector store), then ingest
    /// recent markdown notes and the designated memory file.
    pub async fn startup_sweep(&self) -> (PruneOutcome, IngestReport) {
        let prune = self.tick().await;

        let ingest = match &self.ingester {
            Some(ingester) => match ingester.ingest_recent(self.markdown_days).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("startup markdown ingestion failed: {e}");
                    IngestReport::default()
                }
            },
            None => IngestReport::default(),
        };

        info!(
            pruned = prune.hard_removed,
            captured = ingest.captured,
            "startup sweep complete"
        );
        (prune, ingest)
    }

    /// One maintenance pass: hard prune plus soft decay. Errors are logged,
    /// never propagated; the next tick retries.
    pub async fn tick(&self) -> PruneOutcome {
        match self.engine.prune(PruneMode::Both).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("maintenance prune failed: {e}");
                PruneOutcome::default()
            }
        }
    }

    /// Spawn the hourly loop. The first tick fires after one full interval;
    /// callers wanting immediate upkeep run `startup_sweep` first.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let outcome = self.tick().await;
                info!(
                    hard = outcome.hard_removed,
                    soft = outcome.soft_touched,
                    "maintenance tick complete"
                );
            }
        })
    }
}
