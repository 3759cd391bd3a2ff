// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed lexical memory store.
//!
//! One record table mirrored row-for-row into an FTS5 index, with an upsert
//! discipline keyed on case-insensitive `(entity, key)`, composite relevance
//! scoring, access-driven TTL refresh, soft confidence decay and hard
//! pruning. All writes are serialized through the single connection; reads
//! run concurrently under WAL.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use memoro_core::{
    new_memory_id, Backend, Category, CheckpointContext, Clock, DecayClass, MemoroError,
    MemoryCandidate, MemoryEntry, PruneReport, SearchResult,
};
use memoro_extract::{classify_decay, compile_match_query, expand_tags, expiry_for};
use rusqlite::params;
use tracing::debug;

use crate::database::{map_tr_err, Database};

/// Candidates fetched per result slot before composite re-ranking.
///
/// `search` orders by raw FTS rank, truncates to `CANDIDATE_FACTOR * limit`,
/// then re-ranks by composite score. A high-composite row outside that window
/// is not recovered; retuning the factor requires rescoring coordination.
const CANDIDATE_FACTOR: usize = 2;

/// Freshness window: expiry further out than this scores a full 1.0.
const FRESHNESS_WINDOW_SECS: f64 = 7.0 * 86_400.0;

/// Composite scoring weights. These are the public ranking contract.
const WEIGHT_BM25: f64 = 0.60;
const WEIGHT_FRESHNESS: f64 = 0.25;
const WEIGHT_CONFIDENCE: f64 = 0.15;

const ENTRY_COLUMNS: &str = "id, text, category, importance, entity, key, value, source, \
     created_at, decay_class, expires_at, last_confirmed_at, confidence, search_tags";

const ENTRY_COLUMNS_QUALIFIED: &str =
    "m.id, m.text, m.category, m.importance, m.entity, m.key, m.value, m.source, \
     m.created_at, m.decay_class, m.expires_at, m.last_confirmed_at, m.confidence, m.search_tags";

/// Decode a full record row into a [`MemoryEntry`], rejecting malformed rows.
fn row_to_entry(row: &rusqlite::Row) -> Result<MemoryEntry, rusqlite::Error> {
    fn parse_col<T: std::str::FromStr>(idx: usize, raw: &str) -> Result<T, rusqlite::Error>
    where
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        raw.parse::<T>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
    }

    let category_raw: String = row.get(2)?;
    let decay_raw: String = row.get(9)?;

    Ok(MemoryEntry {
        id: row.get(0)?,
        text: row.get(1)?,
        category: parse_col::<Category>(2, &category_raw)?,
        importance: row.get(3)?,
        entity: row.get(4)?,
        key: row.get(5)?,
        value: row.get(6)?,
        source: row.get(7)?,
        created_at: row.get(8)?,
        decay_class: parse_col::<DecayClass>(9, &decay_raw)?,
        expires_at: row.get(10)?,
        last_confirmed_at: row.get(11)?,
        confidence: row.get(12)?,
        search_tags: row.get(13)?,
    })
}

/// Freshness component of the composite score.
fn freshness_score(expires_at: Option<i64>, now: i64) -> f64 {
    match expires_at {
        None => 1.0,
        Some(exp) if exp <= now => 0.0,
        Some(exp) => ((exp - now) as f64 / FRESHNESS_WINDOW_SECS).min(1.0),
    }
}

/// Persistent lexical store over the record table and its FTS index.
pub struct LexicalStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl LexicalStore {
    /// Open the store at `path`, creating directories and running migrations.
    pub async fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, MemoroError> {
        let db = Database::open(path).await?;
        Ok(Self { db, clock })
    }

    /// Write a candidate, upserting in place when a case-insensitive
    /// `(entity, key)` match exists. The existing row keeps its id; all other
    /// fields are overwritten. Returns the stored entry.
    pub async fn store(&self, candidate: MemoryCandidate) -> Result<MemoryEntry, MemoroError> {
        let now = self.clock.now();
        let decay_class = candidate.decay_class.unwrap_or_else(|| {
            classify_decay(
                candidate.entity.as_deref(),
                candidate.key.as_deref(),
                &candidate.text,
            )
        });
        let expires_at = match decay_class {
            DecayClass::Permanent => None,
            _ => candidate.expires_at.or_else(|| expiry_for(decay_class, now)),
        };
        let search_tags = candidate.search_tags.clone().unwrap_or_else(|| {
            expand_tags(
                &candidate.text,
                candidate.entity.as_deref(),
                candidate.key.as_deref(),
                candidate.value.as_deref(),
            )
        });

        let mut entry = MemoryEntry {
            id: new_memory_id(),
            text: candidate.text,
            category: candidate.category.unwrap_or(Category::Other),
            importance: candidate.importance,
            entity: candidate.entity,
            key: candidate.key,
            value: candidate.value,
            source: candidate.source,
            created_at: now,
            decay_class,
            expires_at,
            last_confirmed_at: now,
            confidence: 1.0,
            search_tags,
        };

        let row = entry.clone();
        let upserted_id: Option<String> = self
            .db
            .connection()
            .call(move |conn| {
                let upsert_target = match (&row.entity, &row.key) {
                    (Some(entity), Some(key)) if !entity.is_empty() && !key.is_empty() => {
                        let mut stmt = conn.prepare(
                            "SELECT id FROM memories
                             WHERE entity IS NOT NULL AND key IS NOT NULL
                               AND lower(entity) = lower(?1) AND lower(key) = lower(?2)",
                        )?;
                        match stmt.query_row(params![entity, key], |r| r.get::<_, String>(0)) {
                            Ok(id) => Some(id),
                            Err(rusqlite::Error::QueryReturnedNoRows) => None,
                            Err(e) => return Err(e.into()),
                        }
                    }
                    _ => None,
                };

                if let Some(existing_id) = upsert_target {
                    conn.execute(
                        "UPDATE memories SET
                             text = ?1, value = ?2, importance = ?3, category = ?4,
                             source = ?5, created_at = ?6, decay_class = ?7, expires_at = ?8,
                             last_confirmed_at = ?9, confidence = ?10, search_tags = ?11
                         WHERE id = ?12",
                        params![
                            row.text,
                            row.value,
                            row.importance,
                            row.category.to_string(),
                            row.source,
                            row.created_at,
                            row.decay_class.to_string(),
                            row.expires_at,
                            row.last_confirmed_at,
                            row.confidence,
                            row.search_tags,
                            existing_id,
                        ],
                    )?;
                    Ok(Some(existing_id))
                } else {
                    conn.execute(
                        &format!("INSERT INTO memories ({ENTRY_COLUMNS}) \
                                  VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
                        params![
                            row.id,
                            row.text,
                            row.category.to_string(),
                            row.importance,
                            row.entity,
                            row.key,
                            row.value,
                            row.source,
                            row.created_at,
                            row.decay_class.to_string(),
                            row.expires_at,
                            row.last_confirmed_at,
                            row.confidence,
                            row.search_tags,
                        ],
                    )?;
                    Ok(None)
                }
            })
            .await
            .map_err(map_tr_err)?;

        if let Some(id) = upserted_id {
            entry.id = id;
        }
        Ok(entry)
    }

    /// Full-text search with composite scoring.
    ///
    /// The compiled disjunction runs against non-expired rows (unless
    /// `include_expired`), ordered by raw FTS rank and truncated to
    /// `2 * limit` candidates before re-ranking by
    /// `0.60 * bm25 + 0.25 * freshness + 0.15 * confidence`.
    /// Returned rows get an access refresh after result assembly.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        include_expired: bool,
    ) -> Result<Vec<SearchResult>, MemoroError> {
        let Some(match_query) = compile_match_query(query) else {
            return Ok(Vec::new());
        };
        let now = self.clock.now();
        let fetch = (limit.max(1) * CANDIDATE_FACTOR) as i64;

        let candidates: Vec<(MemoryEntry, f64)> = self
            .db
            .connection()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS_QUALIFIED}, bm25(memories_fts) AS rank
                     FROM memories_fts
                     JOIN memories m ON m.rowid = memories_fts.rowid
                     WHERE memories_fts MATCH ?1
                       AND (?2 OR m.expires_at IS NULL OR m.expires_at > ?3)
                     ORDER BY bm25(memories_fts)
                     LIMIT ?4"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![match_query, include_expired, now, fetch], |row| {
                        Ok((row_to_entry(row)?, row.get::<_, f64>(14)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let min_rank = candidates.iter().map(|(_, r)| *r).fold(f64::INFINITY, f64::min);
        let max_rank = candidates
            .iter()
            .map(|(_, r)| *r)
            .fold(f64::NEG_INFINITY, f64::max);
        let spread = (max_rank - min_rank).max(1.0);

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|(entry, rank)| {
                let bm25 = 1.0 - (rank - min_rank) / spread;
                let score = WEIGHT_BM25 * bm25
                    + WEIGHT_FRESHNESS * freshness_score(entry.expires_at, now)
                    + WEIGHT_CONFIDENCE * entry.confidence;
                SearchResult {
                    entry,
                    score,
                    backend: Backend::Sqlite,
                }
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);

        let ids: Vec<String> = results.iter().map(|r| r.entry.id.clone()).collect();
        self.refresh_access(&ids).await?;
        Ok(results)
    }

    /// Case-insensitive entity (and optional key) lookup over non-expired
    /// rows, ordered by `confidence DESC, created_at DESC`. The result score
    /// is the record's own confidence. Triggers access refresh.
    pub async fn lookup(
        &self,
        entity: &str,
        key: Option<&str>,
    ) -> Result<Vec<SearchResult>, MemoroError> {
        let now = self.clock.now();
        let entity = entity.to_string();
        let key = key.map(str::to_string);

        let entries: Vec<MemoryEntry> = self
            .db
            .connection()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {ENTRY_COLUMNS} FROM memories
                     WHERE entity IS NOT NULL AND lower(entity) = lower(?1)
                       AND (?2 IS NULL OR (key IS NOT NULL AND lower(key) = lower(?2)))
                       AND (expires_at IS NULL OR expires_at > ?3)
                     ORDER BY confidence DESC, created_at DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![entity, key, now], row_to_entry)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;

        let ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
        let results = entries
            .into_iter()
            .map(|entry| {
                let score = entry.confidence;
                SearchResult {
                    entry,
                    score,
                    backend: Backend::Sqlite,
                }
            })
            .collect();
        self.refresh_access(&ids).await?;
        Ok(results)
    }

    /// Fetch a single record by id.
    pub async fn get(&self, id: &str) -> Result<Option<MemoryEntry>, MemoroError> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let sql = format!("SELECT {ENTRY_COLUMNS} FROM memories WHERE id = ?1");
                let mut stmt = conn.prepare(&sql)?;
                match stmt.query_row(params![id], row_to_entry) {
                    Ok(entry) => Ok(Some(entry)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(map_tr_err)
    }

    /// Mark rows as confirmed now; extend expiry for stable/active only.
    pub async fn refresh_access(&self, ids: &[String]) -> Result<(), MemoroError> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let ids = ids.to_vec();
        self.db
            .connection()
            .call(move |conn| {
                let placeholders: Vec<String> =
                    (2..ids.len() + 2).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "UPDATE memories SET
                         last_confirmed_at = ?1,
                         expires_at = CASE decay_class
                             WHEN 'stable' THEN ?1 + 7776000
                             WHEN 'active' THEN ?1 + 1209600
                             ELSE expires_at
                         END
                     WHERE id IN ({})",
                    placeholders.join(", ")
                );
                let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&now];
                for id in &ids {
                    params.push(id);
                }
                conn.execute(&sql, params.as_slice())?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)
    }

    /// Soft decay: linearly interpolate confidence between the last
    /// confirmation and the hard expiry, floored at 0.05. Pure update, no
    /// deletions. Returns the number of rows touched.
    pub async fn decay_confidence(&self) -> Result<usize, MemoroError> {
        let now = self.clock.now();
        self.db
            .connection()
            .call(move |conn| {
                let touched = conn.execute(
                    "UPDATE memories SET confidence = MAX(
                         0.05,
                         1.0 - (CAST(?1 - last_confirmed_at AS REAL)
                                / CAST(expires_at - last_confirmed_at AS REAL))
                     )
                     WHERE expires_at IS NOT NULL AND expires_at > last_confirmed_at",
                    params![now],
                )?;
                Ok(touched)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Hard prune: delete every row whose expiry has passed. Permanent rows
    /// have no expiry and never leave. Returns the removed ids so the vector
    /// store can mirror the deletion.
    pub async fn prune_expired(&self) -> Result<PruneReport, MemoroError> {
        let now = self.clock.now();
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM memories WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    )?;
                    let rows = stmt
                        .query_map(params![now], |row| row.get(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };
                tx.execute(
                    "DELETE FROM memories WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now],
                )?;
                tx.commit()?;
                Ok(PruneReport {
                    count: ids.len(),
                    ids,
                })
            })
            .await
            .map_err(map_tr_err)
    }

    /// Reset a row to full confidence and recompute its expiry from its
    /// decay class. Returns whether the row existed.
    pub async fn confirm_fact(&self, id: &str) -> Result<bool, MemoroError> {
        let now = self.clock.now();
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let class: Option<String> = {
                    let mut stmt =
                        conn.prepare("SELECT decay_class FROM memories WHERE id = ?1")?;
                    match stmt.query_row(params![id], |row| row.get(0)) {
                        Ok(c) => Some(c),
                        Err(rusqlite::Error::QueryReturnedNoRows) => None,
                        Err(e) => return Err(e.into()),
                    }
                };
                let Some(class_raw) = class else {
                    return Ok(false);
                };
                let class = class_raw.parse::<DecayClass>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let expires_at = expiry_for(class, now);
                conn.execute(
                    "UPDATE memories SET confidence = 1.0, last_confirmed_at = ?1, expires_at = ?2
                     WHERE id = ?3",
                    params![now, expires_at, id],
                )?;
                Ok(true)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Persist a checkpoint context as a short-lived record. Returns its id.
    pub async fn save_checkpoint(
        &self,
        mut ctx: CheckpointContext,
    ) -> Result<String, MemoroError> {
        let now = self.clock.now();
        ctx.saved_at = now;
        let blob = serde_json::to_string(&ctx)
            .map_err(|e| MemoroError::Internal(format!("checkpoint encode failed: {e}")))?;

        let entry = self
            .store(MemoryCandidate {
                text: blob,
                entity: Some("system".to_string()),
                key: Some(format!("checkpoint:{now}")),
                decay_class: Some(DecayClass::Checkpoint),
                source: "checkpoint".to_string(),
                ..MemoryCandidate::from_text("")
            })
            .await?;
        debug!(id = %entry.id, "checkpoint saved");
        Ok(entry.id)
    }

    /// Restore the most recent non-expired checkpoint, or `None`. Malformed
    /// blobs are treated as missing and the next most recent is tried.
    pub async fn restore_checkpoint(&self) -> Result<Option<CheckpointContext>, MemoroError> {
        let now = self.clock.now();
        let blobs: Vec<String> = self
            .db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT text FROM memories
                     WHERE decay_class = 'checkpoint' AND entity = 'system'
                       AND (expires_at IS NULL OR expires_at > ?1)
                     ORDER BY created_at DESC",
                )?;
                let rows = stmt
                    .query_map(params![now], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)?;

        for blob in blobs {
            match serde_json::from_str::<CheckpointContext>(&blob) {
                Ok(ctx) => return Ok(Some(ctx)),
                Err(e) => debug!("skipping malformed checkpoint blob: {e}"),
            }
        }
        Ok(None)
    }

    /// Total number of records.
    pub async fn count(&self) -> Result<usize, MemoroError> {
        self.db
            .connection()
            .call(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
                Ok(n as usize)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Number of records whose expiry has passed but are not yet pruned.
    pub async fn count_expired(&self) -> Result<usize, MemoroError> {
        let now = self.clock.now();
        self.db
            .connection()
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM memories WHERE expires_at IS NOT NULL AND expires_at < ?1",
                    params![now],
                    |r| r.get(0),
                )?;
                Ok(n as usize)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Record counts grouped by decay class.
    pub async fn stats_breakdown(&self) -> Result<HashMap<DecayClass, usize>, MemoroError> {
        self.db
            .connection()
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT decay_class, COUNT(*) FROM memories GROUP BY decay_class",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(map_tr_err)
            .map(|rows| {
                rows.into_iter()
                    .filter_map(|(class, n)| {
                        class.parse::<DecayClass>().ok().map(|c| (c, n as usize))
                    })
                    .collect()
            })
    }

    /// Exact-text duplicate probe.
    pub async fn has_duplicate(&self, text: &str) -> Result<bool, MemoroError> {
        let text = text.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let exists: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM memories WHERE text = ?1)",
                    params![text],
                    |r| r.get(0),
                )?;
                Ok(exists)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Delete by id. Returns whether a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, MemoroError> {
        let id = id.to_string();
        self.db
            .connection()
            .call(move |conn| {
                let n = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Re-run the decay classifier over rows that are `stable` or carry a
    /// null expiry without being permanent, writing class and expiry changes
    /// in a single transaction. Returns a by-class count of updates.
    pub async fn backfill_decay_classes(
        &self,
    ) -> Result<HashMap<DecayClass, usize>, MemoroError> {
        let now = self.clock.now();
        self.db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction()?;
                let rows: Vec<(String, Option<String>, Option<String>, String, String, Option<i64>)> = {
                    let mut stmt = tx.prepare(
                        "SELECT id, entity, key, text, decay_class, expires_at FROM memories
                         WHERE decay_class = 'stable'
                            OR (expires_at IS NULL AND decay_class != 'permanent')",
                    )?;
                    let rows = stmt
                        .query_map([], |row| {
                            Ok((
                                row.get(0)?,
                                row.get(1)?,
                                row.get(2)?,
                                row.get(3)?,
                                row.get(4)?,
                                row.get(5)?,
                            ))
                        })?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows
                };

                let mut updates: HashMap<DecayClass, usize> = HashMap::new();
                for (id, entity, key, text, old_class, expires_at) in rows {
                    let new_class = classify_decay(entity.as_deref(), key.as_deref(), &text);
                    let class_changed = new_class.to_string() != old_class;
                    let needs_expiry =
                        expires_at.is_none() && new_class != DecayClass::Permanent;
                    if class_changed || needs_expiry {
                        tx.execute(
                            "UPDATE memories SET decay_class = ?1, expires_at = ?2 WHERE id = ?3",
                            params![new_class.to_string(), expiry_for(new_class, now), id],
                        )?;
                        *updates.entry(new_class).or_insert(0) += 1;
                    }
                }
                tx.commit()?;
                Ok(updates)
            })
            .await
            .map_err(map_tr_err)
    }

    /// Checkpoint the WAL ahead of shutdown.
    pub async fn close(&self) -> Result<(), MemoroError> {
        self.db.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoro_core::FixedClock;
    use tempfile::tempdir;

    const T0: i64 = 1_700_000_000;

    async fn setup() -> (LexicalStore, Arc<FixedClock>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(T0));
        let store = LexicalStore::open(dir.path().join("memories.db"), clock.clone())
            .await
            .unwrap();
        (store, clock, dir)
    }

    fn candidate(text: &str) -> MemoryCandidate {
        MemoryCandidate::from_text(text)
    }

    fn keyed(entity: &str, key: &str, value: &str) -> MemoryCandidate {
        MemoryCandidate {
            entity: Some(entity.to_string()),
            key: Some(key.to_string()),
            value: Some(value.to_string()),
            ..MemoryCandidate::from_text(format!("{entity} {key} is {value}"))
        }
    }

    #[tokio::test]
    async fn store_and_get_roundtrip() {
        let (store, _, _dir) = setup().await;
        let entry = store
            .store(candidate("The staging URL is internal-only"))
            .await
            .unwrap();

        let fetched = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(fetched.text, "The staging URL is internal-only");
        assert_eq!(fetched.created_at, T0);
        assert_eq!(fetched.last_confirmed_at, T0);
        assert_eq!(fetched.confidence, 1.0);
    }

    #[tokio::test]
    async fn upsert_preserves_id_case_insensitively() {
        let (store, _, _dir) = setup().await;

        let first = store.store(keyed("fred", "email", "a@old.io")).await.unwrap();
        let second = store.store(keyed("Fred", "EMAIL", "b@new.io")).await.unwrap();

        assert_eq!(first.id, second.id, "upsert must keep the original id");
        assert_eq!(store.count().await.unwrap(), 1);

        let hits = store.lookup("FRED", Some("email")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.value.as_deref(), Some("b@new.io"));
    }

    #[tokio::test]
    async fn upsert_requires_both_entity_and_key() {
        let (store, _, _dir) = setup().await;
        let mut a = candidate("first note about deploys");
        a.entity = Some("deploys".to_string());
        let mut b = candidate("second note about deploys");
        b.entity = Some("deploys".to_string());

        store.store(a).await.unwrap();
        store.store(b).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2, "entity alone is not an upsert key");
    }

    #[tokio::test]
    async fn session_text_gets_session_ttl() {
        let (store, _, _dir) = setup().await;
        let entry = store.store(candidate("Currently debugging auth")).await.unwrap();

        assert_eq!(entry.decay_class, DecayClass::Session);
        let expires = entry.expires_at.unwrap();
        assert!(expires - T0 <= 86_400);
        assert!(expires > T0);
    }

    #[tokio::test]
    async fn permanent_rows_have_no_expiry() {
        let (store, _, _dir) = setup().await;
        let entry = store
            .store(keyed("user", "email", "fred@example.com"))
            .await
            .unwrap();
        assert_eq!(entry.decay_class, DecayClass::Permanent);
        assert_eq!(entry.expires_at, None);
    }

    #[tokio::test]
    async fn search_empty_and_stopword_queries_return_nothing() {
        let (store, _, _dir) = setup().await;
        store.store(candidate("something searchable exists")).await.unwrap();

        assert!(store.search("", 5, false).await.unwrap().is_empty());
        assert!(store.search("a a a", 5, false).await.unwrap().is_empty());
        assert!(store.search("the of and", 5, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_respects_limit_and_sorts_descending() {
        let (store, _, _dir) = setup().await;
        for i in 0..8 {
            store
                .store(candidate(&format!("deploy pipeline note number {i}")))
                .await
                .unwrap();
        }

        let results = store.search("deploy pipeline", 3, false).await.unwrap();
        assert!(results.len() <= 3);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score, "scores must be non-increasing");
        }
    }

    #[tokio::test]
    async fn search_skips_expired_rows() {
        let (store, _, _dir) = setup().await;
        store
            .store(MemoryCandidate {
                decay_class: Some(DecayClass::Permanent),
                ..candidate("API port 3000 for the gateway")
            })
            .await
            .unwrap();
        store
            .store(MemoryCandidate {
                decay_class: Some(DecayClass::Session),
                expires_at: Some(T0 - 100),
                ..candidate("API port 8080 for the gateway")
            })
            .await
            .unwrap();

        let results = store.search("API port", 5, false).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].entry.text.contains("3000"));

        let with_expired = store.search("API port", 5, true).await.unwrap();
        assert_eq!(with_expired.len(), 2);
    }

    #[tokio::test]
    async fn search_matches_synonym_tags() {
        let (store, _, _dir) = setup().await;
        let entry = store.store(candidate("Fred prefers TypeScript")).await.unwrap();
        assert!(entry.search_tags.contains("javascript"));

        // "javascript" appears only in the tags, never in the text.
        let results = store.search("javascript", 5, false).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.id, entry.id);
    }

    #[tokio::test]
    async fn access_refresh_extends_stable_but_not_session() {
        let (store, clock, _dir) = setup().await;
        let stable = store.store(candidate("the warehouse runs nightly")).await.unwrap();
        let session = store.store(candidate("Currently debugging auth")).await.unwrap();
        assert_eq!(stable.decay_class, DecayClass::Stable);

        clock.advance(1_000);
        store
            .refresh_access(&[stable.id.clone(), session.id.clone()])
            .await
            .unwrap();

        let stable_after = store.get(&stable.id).await.unwrap().unwrap();
        assert_eq!(stable_after.last_confirmed_at, T0 + 1_000);
        assert_eq!(stable_after.expires_at, Some(T0 + 1_000 + 7_776_000));

        let session_after = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(session_after.last_confirmed_at, T0 + 1_000);
        assert_eq!(session_after.expires_at, session.expires_at, "session expiry untouched");
    }

    #[tokio::test]
    async fn search_triggers_access_refresh() {
        let (store, clock, _dir) = setup().await;
        let entry = store.store(candidate("the importer batches rows")).await.unwrap();

        clock.advance(5_000);
        let results = store.search("importer", 5, false).await.unwrap();
        assert_eq!(results.len(), 1);

        let after = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(after.last_confirmed_at, T0 + 5_000);
    }

    #[tokio::test]
    async fn decay_confidence_interpolates_and_floors() {
        let (store, clock, _dir) = setup().await;
        let entry = store
            .store(MemoryCandidate {
                decay_class: Some(DecayClass::Session),
                ..candidate("short lived scratch note")
            })
            .await
            .unwrap();

        // Halfway through the 24h window.
        clock.advance(43_200);
        let touched = store.decay_confidence().await.unwrap();
        assert!(touched >= 1);
        let halfway = store.get(&entry.id).await.unwrap().unwrap();
        assert!((halfway.confidence - 0.5).abs() < 0.01, "got {}", halfway.confidence);

        // Way past expiry: floored, never below 0.05, never deleted.
        clock.advance(86_400 * 10);
        store.decay_confidence().await.unwrap();
        let floored = store.get(&entry.id).await.unwrap().unwrap();
        assert!((floored.confidence - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn decay_confidence_skips_permanent_rows() {
        let (store, clock, _dir) = setup().await;
        let entry = store
            .store(keyed("user", "email", "fred@example.com"))
            .await
            .unwrap();

        clock.advance(86_400 * 365);
        store.decay_confidence().await.unwrap();
        let after = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(after.confidence, 1.0);
    }

    #[tokio::test]
    async fn prune_removes_exactly_expired_rows() {
        let (store, clock, _dir) = setup().await;
        let permanent = store
            .store(keyed("user", "email", "fred@example.com"))
            .await
            .unwrap();
        let session = store.store(candidate("Currently debugging auth")).await.unwrap();
        let stable = store.store(candidate("the importer batches rows")).await.unwrap();

        clock.advance(2 * 86_400); // past session TTL, within stable TTL
        let report = store.prune_expired().await.unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(report.ids, vec![session.id.clone()]);

        assert!(store.get(&permanent.id).await.unwrap().is_some());
        assert!(store.get(&stable.id).await.unwrap().is_some());
        assert!(store.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn count_expired_tracks_clock() {
        let (store, clock, _dir) = setup().await;
        store.store(candidate("Currently debugging auth")).await.unwrap();
        assert_eq!(store.count_expired().await.unwrap(), 0);

        clock.advance(2 * 86_400);
        assert_eq!(store.count_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn confirm_fact_resets_confidence_and_expiry() {
        let (store, clock, _dir) = setup().await;
        let entry = store.store(candidate("the importer batches rows")).await.unwrap();

        clock.advance(86_400 * 30);
        store.decay_confidence().await.unwrap();
        let decayed = store.get(&entry.id).await.unwrap().unwrap();
        assert!(decayed.confidence < 1.0);

        assert!(store.confirm_fact(&entry.id).await.unwrap());
        let confirmed = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(confirmed.confidence, 1.0);
        assert_eq!(confirmed.last_confirmed_at, T0 + 86_400 * 30);
        assert_eq!(confirmed.expires_at, Some(T0 + 86_400 * 30 + 7_776_000));

        assert!(!store.confirm_fact("no-such-id").await.unwrap());
    }

    #[tokio::test]
    async fn checkpoint_save_and_restore() {
        let (store, _, _dir) = setup().await;
        let ctx = CheckpointContext {
            intent: "migrate the billing tables".to_string(),
            state: "schema diff reviewed".to_string(),
            expected_outcome: Some("zero-downtime cutover".to_string()),
            working_files: Some(vec!["migrations/007.sql".to_string()]),
            saved_at: 0,
        };
        let id = store.save_checkpoint(ctx).await.unwrap();
        assert!(!id.is_empty());

        let restored = store.restore_checkpoint().await.unwrap().unwrap();
        assert_eq!(restored.intent, "migrate the billing tables");
        assert_eq!(restored.saved_at, T0);
    }

    #[tokio::test]
    async fn restore_skips_malformed_blobs() {
        let (store, clock, _dir) = setup().await;
        let ctx = CheckpointContext {
            intent: "valid".to_string(),
            state: "valid".to_string(),
            expected_outcome: None,
            working_files: None,
            saved_at: 0,
        };
        store.save_checkpoint(ctx).await.unwrap();

        // A later checkpoint row whose blob is not JSON.
        clock.advance(60);
        store
            .store(MemoryCandidate {
                entity: Some("system".to_string()),
                key: Some(format!("checkpoint:{}", T0 + 60)),
                decay_class: Some(DecayClass::Checkpoint),
                source: "checkpoint".to_string(),
                ..candidate("not json at all")
            })
            .await
            .unwrap();

        let restored = store.restore_checkpoint().await.unwrap().unwrap();
        assert_eq!(restored.intent, "valid");
    }

    #[tokio::test]
    async fn restore_ignores_expired_checkpoints() {
        let (store, clock, _dir) = setup().await;
        let ctx = CheckpointContext {
            intent: "old".to_string(),
            state: "old".to_string(),
            expected_outcome: None,
            working_files: None,
            saved_at: 0,
        };
        store.save_checkpoint(ctx).await.unwrap();

        clock.advance(5 * 3_600); // past the 4h checkpoint TTL
        assert!(store.restore_checkpoint().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_breakdown_groups_by_class() {
        let (store, _, _dir) = setup().await;
        store.store(keyed("user", "email", "a@b.c")).await.unwrap();
        store.store(candidate("Currently debugging auth")).await.unwrap();
        store.store(candidate("the importer batches rows")).await.unwrap();
        store.store(candidate("the exporter batches rows")).await.unwrap();

        let breakdown = store.stats_breakdown().await.unwrap();
        assert_eq!(breakdown.get(&DecayClass::Permanent), Some(&1));
        assert_eq!(breakdown.get(&DecayClass::Session), Some(&1));
        assert_eq!(breakdown.get(&DecayClass::Stable), Some(&2));
    }

    #[tokio::test]
    async fn has_duplicate_is_exact_match() {
        let (store, _, _dir) = setup().await;
        store.store(candidate("exact text here")).await.unwrap();

        assert!(store.has_duplicate("exact text here").await.unwrap());
        assert!(!store.has_duplicate("Exact Text Here").await.unwrap());
        assert!(!store.has_duplicate("different text").await.unwrap());
    }

    #[tokio::test]
    async fn delete_returns_presence() {
        let (store, _, _dir) = setup().await;
        let entry = store.store(candidate("removable fact")).await.unwrap();

        assert!(store.delete(&entry.id).await.unwrap());
        assert!(!store.delete(&entry.id).await.unwrap());
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn backfill_reclassifies_stable_rows() {
        let (store, _, _dir) = setup().await;
        // Stored with an explicit (wrong) stable class; the classifier would
        // call this session state.
        let entry = store
            .store(MemoryCandidate {
                decay_class: Some(DecayClass::Stable),
                ..candidate("Currently debugging the session handler")
            })
            .await
            .unwrap();

        let updates = store.backfill_decay_classes().await.unwrap();
        assert_eq!(updates.get(&DecayClass::Session), Some(&1));

        let after = store.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(after.decay_class, DecayClass::Session);
        assert!(after.expires_at.unwrap() <= T0 + 86_400);

        // Fixed point: a second pass changes nothing.
        let again = store.backfill_decay_classes().await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn lookup_orders_by_confidence_then_recency() {
        let (store, clock, _dir) = setup().await;
        store.store(keyed("fred", "editor", "vscode")).await.unwrap();
        clock.advance(10);
        store.store(keyed("fred", "shell", "fish")).await.unwrap();

        // Decay the older row's confidence a little.
        clock.advance(86_400 * 30);
        store.decay_confidence().await.unwrap();
        clock.advance(10);
        store.store(keyed("fred", "terminal", "ghostty")).await.unwrap();

        let results = store.lookup("FRED", None).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].entry.key.as_deref(), Some("terminal"));
        for pair in results.windows(2) {
            assert!(pair[0].entry.confidence >= pair[1].entry.confidence);
        }
        // Lookup score is the record's own confidence.
        assert_eq!(results[0].score, results[0].entry.confidence);
    }
}
