// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The memory engine facade.
//!
//! Orchestrates extractor, lexical store, embedder and vector store behind
//! five operations: recall, store, forget, checkpoint and prune. The lexical
//! path is authoritative; embedding and vector failures are absorbed and
//! logged, degrading recall to lexical-only and skipping the vector write.
//! Within one ingest the lexical write always precedes the vector write.

use std::path::PathBuf;
use std::sync::Arc;

use memoro_config::{MemoroConfig, MemoryConfig};
use memoro_core::{
    is_uuid_shaped, CheckpointContext, Clock, Embedder, MemoroError, MemoryCandidate,
    SearchResult, StoreOutcome,
};
use memoro_extract::{detect_category, extract_for_category};
use memoro_lexical::LexicalStore;
use memoro_vector::{VectorRecord, VectorStore};
use strum::{Display, EnumString};
use tracing::{debug, info, warn};

use crate::fuse::merge_results;

/// Which prune passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum PruneMode {
    /// Delete rows whose expiry has passed, mirroring ids to the vector store.
    Hard,
    /// Soft confidence decay only.
    Soft,
    /// Hard prune followed by soft decay.
    Both,
}

/// Counters from a prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Lexical rows removed by the hard pass.
    pub hard_removed: usize,
    /// Vector rows removed while mirroring the hard pass.
    pub vector_removed: usize,
    /// Rows touched by soft confidence decay.
    pub soft_touched: usize,
}

/// A forget request: by id, or by query for disambiguation.
#[derive(Debug, Clone)]
pub enum ForgetRequest {
    ById(String),
    ByQuery(String),
}

/// Result of a forget call.
#[derive(Debug, Clone)]
pub enum ForgetOutcome {
    /// The record was removed from both stores.
    Deleted { id: String },
    /// No record with that id exists.
    NotFound { id: String },
    /// Top fused matches for the query, returned for disambiguation.
    Candidates(Vec<SearchResult>),
}

/// Long-lived memory engine over the lexical and vector stores.
pub struct MemoryEngine {
    lexical: Arc<LexicalStore>,
    vector: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    clock: Arc<dyn Clock>,
    config: MemoryConfig,
}

impl MemoryEngine {
    pub fn new(
        lexical: Arc<LexicalStore>,
        vector: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            lexical,
            vector,
            embedder,
            clock,
            config,
        }
    }

    /// Open both stores at the configured paths and assemble the engine.
    ///
    /// A lexical open or migration failure propagates; the engine refuses to
    /// start without its authoritative store.
    pub async fn open(
        config: &MemoroConfig,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MemoroError> {
        let data_dir = PathBuf::from(&config.storage.data_dir);
        let lexical = LexicalStore::open(
            data_dir.join(&config.storage.lexical_file),
            clock.clone(),
        )
        .await?;
        let vector = VectorStore::open(
            data_dir.join(&config.storage.vector_dir),
            embedder.dimensions(),
            clock.clone(),
        )
        .await?;
        info!(data_dir = %data_dir.display(), "memory engine opened");
        Ok(Self::new(
            Arc::new(lexical),
            Arc::new(vector),
            embedder,
            clock,
            config.memory.clone(),
        ))
    }

    pub fn lexical(&self) -> &Arc<LexicalStore> {
        &self.lexical
    }

    pub fn vector(&self) -> &Arc<VectorStore> {
        &self.vector
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Embed within a guarded block: provider errors log at warn and yield
    /// `None`, downgrading the caller to lexical-only behavior.
    pub(crate) async fn embed_guarded(&self, text: &str) -> Option<Vec<f32>> {
        match self.embedder.embed(text).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                warn!("embedding failed, continuing without vector path: {e}");
                None
            }
        }
    }

    /// Hybrid recall: optional entity lookup plus FTS search form the lexical
    /// list; the embedded query drives vector search; fusion dedups with
    /// lexical priority and truncates to `limit`.
    pub async fn recall(
        &self,
        query: &str,
        limit: usize,
        entity: Option<&str>,
    ) -> Result<Vec<SearchResult>, MemoroError> {
        let mut lexical_results = Vec::new();
        if let Some(entity) = entity {
            lexical_results.extend(self.lexical.lookup(entity, None).await?);
        }
        lexical_results.extend(self.lexical.search(query, limit, false).await?);

        let vector_results = match self.embed_guarded(query).await {
            Some(vector) => self
                .vector
                .search(&vector, limit, self.config.min_vector_score)
                .await
                .unwrap_or_else(|e| {
                    warn!("vector search failed, lexical-only recall: {e}");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        Ok(merge_results(lexical_results, vector_results, limit))
    }

    /// Store a statement. Identical text short-circuits to a duplicate
    /// marker; otherwise the extractor fills missing structure, the lexical
    /// store writes (or upserts), and the vector write follows best-effort
    /// behind a near-duplicate guard.
    pub async fn store(&self, candidate: MemoryCandidate) -> Result<StoreOutcome, MemoroError> {
        if candidate.text.is_empty() {
            return Err(MemoroError::InvalidInput(
                "memory text must not be empty".to_string(),
            ));
        }
        if self.lexical.has_duplicate(&candidate.text).await? {
            debug!("identical text already stored, returning duplicate marker");
            return Ok(StoreOutcome::Duplicate);
        }

        let mut candidate = candidate;
        let category = match candidate.category {
            Some(category) => category,
            None => {
                let detected = detect_category(&candidate.text);
                candidate.category = Some(detected);
                detected
            }
        };
        if candidate.entity.is_none() && candidate.key.is_none() && candidate.value.is_none() {
            if let Some(extraction) = extract_for_category(&candidate.text, category) {
                candidate.entity = extraction.entity;
                candidate.key = extraction.key;
                candidate.value = extraction.value;
            }
        }

        let entry = self.lexical.store(candidate).await?;

        if let Some(vector) = self.embed_guarded(&entry.text).await {
            match self
                .vector
                .has_duplicate(&vector, self.config.duplicate_threshold)
                .await
            {
                Ok(true) => debug!(id = %entry.id, "near-duplicate vector, skipping vector write"),
                Ok(false) => {
                    if let Err(e) = self
                        .vector
                        .store(VectorRecord {
                            id: Some(entry.id.clone()),
                            text: entry.text.clone(),
                            vector,
                            importance: entry.importance,
                            category: entry.category,
                        })
                        .await
                    {
                        warn!(id = %entry.id, "vector write skipped: {e}");
                    }
                }
                Err(e) => warn!("vector duplicate probe failed, skipping write: {e}"),
            }
        }

        Ok(StoreOutcome::Created {
            id: entry.id,
            decay_class: entry.decay_class,
        })
    }

    /// Forget by id (delete in both stores) or by query (return fused top-5
    /// candidates for disambiguation).
    pub async fn forget(&self, request: ForgetRequest) -> Result<ForgetOutcome, MemoroError> {
        match request {
            ForgetRequest::ById(id) => {
                if !is_uuid_shaped(&id) {
                    return Err(MemoroError::InvalidInput(format!(
                        "malformed memory id: {id}"
                    )));
                }
                let existed = self.lexical.delete(&id).await?;
                if let Err(e) = self.vector.delete(&id).await {
                    warn!(id, "vector delete failed during forget: {e}");
                }
                if existed {
                    Ok(ForgetOutcome::Deleted { id })
                } else {
                    Ok(ForgetOutcome::NotFound { id })
                }
            }
            ForgetRequest::ByQuery(query) => {
                if query.trim().is_empty() {
                    return Err(MemoroError::InvalidInput(
                        "forget requires a memory id or a non-empty query".to_string(),
                    ));
                }
                let candidates = self.recall(&query, 5, None).await?;
                Ok(ForgetOutcome::Candidates(candidates))
            }
        }
    }

    /// Persist a checkpoint. `intent` and `state` are required.
    pub async fn checkpoint_save(
        &self,
        intent: &str,
        state: &str,
        expected_outcome: Option<String>,
        working_files: Option<Vec<String>>,
    ) -> Result<String, MemoroError> {
        if intent.trim().is_empty() || state.trim().is_empty() {
            return Err(MemoroError::InvalidInput(
                "checkpoint save requires non-empty intent and state".to_string(),
            ));
        }
        self.lexical
            .save_checkpoint(CheckpointContext {
                intent: intent.to_string(),
                state: state.to_string(),
                expected_outcome,
                working_files,
                saved_at: self.clock.now(),
            })
            .await
    }

    /// Restore the most recent non-expired checkpoint, if any.
    pub async fn checkpoint_restore(&self) -> Result<Option<CheckpointContext>, MemoroError> {
        self.lexical.restore_checkpoint().await
    }

    /// Run the requested prune passes. The lexical store is authoritative for
    /// residency; vector deletions mirror its ids and failures are retried on
    /// the next maintenance tick.
    pub async fn prune(&self, mode: PruneMode) -> Result<PruneOutcome, MemoroError> {
        let mut outcome = PruneOutcome::default();

        if matches!(mode, PruneMode::Hard | PruneMode::Both) {
            let report = self.lexical.prune_expired().await?;
            outcome.hard_removed = report.count;
            outcome.vector_removed = self.vector.delete_many(&report.ids).await;
            if outcome.hard_removed > 0 {
                info!(
                    lexical = outcome.hard_removed,
                    vector = outcome.vector_removed,
                    "hard prune complete"
                );
            }
        }

        if matches!(mode, PruneMode::Soft | PruneMode::Both) {
            outcome.soft_touched = self.lexical.decay_confidence().await?;
            debug!(rows = outcome.soft_touched, "soft decay complete");
        }

        Ok(outcome)
    }

    /// Probe both stores. The lexical store must answer or the error
    /// propagates; a failing vector store only degrades the result, since
    /// recall still works lexical-only.
    pub async fn health_check(&self) -> Result<bool, MemoroError> {
        self.lexical.count().await?;
        match self.vector.count().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("vector store unhealthy: {e}");
                Ok(false)
            }
        }
    }

    /// Checkpoint the lexical WAL ahead of shutdown.
    pub async fn close(&self) -> Result<(), MemoroError> {
        self.lexical.close().await
    }
}
