// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Agent lifecycle hooks: pre-turn auto-recall and post-turn auto-capture.
//!
//! `before_agent_start` turns the incoming prompt into a prepend-context
//! block tagged `<relevant-memories>`. `agent_end` walks the turn's user
//! messages through the capture filter and stores what qualifies. Capture
//! failures are logged and swallowed; a memory subsystem must never break
//! the agent turn.

use memoro_core::{MemoryCandidate, StoreOutcome};
use memoro_extract::{extract_for_category, detect_category, should_capture};
use tracing::{debug, warn};

use crate::engine::MemoryEngine;
use crate::fuse::merge_results;

/// Prompts shorter than this skip auto-recall entirely.
const MIN_PROMPT_LEN: usize = 5;

/// Per-backend depth for the pre-turn fetch.
const AUTO_RECALL_PER_BACKEND: usize = 3;

/// Fused size of the prepend block.
const AUTO_RECALL_LIMIT: usize = 5;

impl MemoryEngine {
    /// Pre-turn hook: fuse lexical top-3 and vector top-3 into at most five
    /// memories and return them as a `<relevant-memories>` block, or `None`
    /// when nothing relevant is stored.
    pub async fn before_agent_start(&self, prompt: &str) -> Option<String> {
        if prompt.trim().chars().count() < MIN_PROMPT_LEN {
            return None;
        }

        let lexical = match self
            .lexical()
            .search(prompt, AUTO_RECALL_PER_BACKEND, false)
            .await
        {
            Ok(results) => results,
            Err(e) => {
                warn!("auto-recall lexical search failed: {e}");
                Vec::new()
            }
        };

        let vector = match self.embed_guarded(prompt).await {
            Some(v) => self
                .vector()
                .search(&v, AUTO_RECALL_PER_BACKEND, self.config().min_vector_score)
                .await
                .unwrap_or_else(|e| {
                    warn!("auto-recall vector search failed: {e}");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let fused = merge_results(lexical, vector, AUTO_RECALL_LIMIT);
        if fused.is_empty() {
            return None;
        }

        let mut block = String::from("<relevant-memories>\n");
        for result in &fused {
            block.push_str(&format!("- {}\n", result.entry.text));
        }
        block.push_str("</relevant-memories>");
        Some(block)
    }

    /// Post-turn hook: capture up to the configured number of eligible user
    /// messages. Returns how many were stored. All failures are swallowed.
    pub async fn agent_end(&self, _success: bool, messages: &[String]) -> usize {
        let mut captured = 0;
        for text in messages {
            if captured >= self.config().auto_capture_max {
                break;
            }
            if !should_capture(text) {
                continue;
            }

            // Only structured statements are worth keeping automatically.
            let category = detect_category(text);
            let Some(extraction) = extract_for_category(text, category) else {
                debug!("auto-capture skipped: no structure extracted");
                continue;
            };
            if extraction.entity.is_none() && extraction.key.is_none() {
                debug!("auto-capture skipped: neither entity nor key");
                continue;
            }

            let candidate = MemoryCandidate {
                category: Some(category),
                entity: extraction.entity,
                key: extraction.key,
                value: extraction.value,
                source: "auto-capture".to_string(),
                ..MemoryCandidate::from_text(text.clone())
            };
            match self.store(candidate).await {
                Ok(StoreOutcome::Created { .. }) => captured += 1,
                Ok(StoreOutcome::Duplicate) => debug!("auto-capture skipped duplicate"),
                Err(e) => warn!("auto-capture store failed: {e}"),
            }
        }
        captured
    }
}
