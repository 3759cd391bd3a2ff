// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! LanceDB-backed vector memory store.
//!
//! One table named `memories` whose vector width is pinned at creation by a
//! seed row that is deleted immediately after. Rows upsert by id via
//! best-effort delete-then-insert. Nearest-neighbor search maps cosine
//! distance to `score = 1 / (1 + distance)` and projects rows into
//! [`MemoryEntry`] shells: `entity`/`key`/`value` are always `None` and the
//! decay class is always `stable`, so TTL semantics do not survive the
//! projection. Callers who need them must re-fetch by id from the lexical
//! store.

use std::path::Path;
use std::sync::Arc;

use arrow_array::builder::{FixedSizeListBuilder, Float32Builder};
use arrow_array::{
    Array, Float32Array, Float64Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use memoro_core::{
    is_uuid_shaped, new_memory_id, Backend, Category, Clock, DecayClass, MemoroError, MemoryEntry,
    SearchResult,
};
use tracing::{debug, warn};

const TABLE_NAME: &str = "memories";
const SEED_ID: &str = "seed";
const LANCE_DISTANCE_COL: &str = "_distance";

/// Default nearest-neighbor score floor.
pub const DEFAULT_MIN_SCORE: f64 = 0.3;

/// Nearest-neighbor score above which a vector counts as a duplicate.
pub const DEFAULT_DUPLICATE_THRESHOLD: f64 = 0.95;

/// Input row for [`VectorStore::store`].
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Existing id to upsert, or `None` to generate a fresh one.
    pub id: Option<String>,
    pub text: String,
    pub vector: Vec<f32>,
    pub importance: f64,
    pub category: Category,
}

#[derive(Debug, Clone)]
struct StoredRow {
    id: String,
    text: String,
    importance: f64,
    category: String,
    created_at: i64,
}

fn vector_err(message: impl Into<String>, e: lancedb::Error) -> MemoroError {
    MemoroError::Vector {
        message: message.into(),
        source: Some(Box::new(e)),
    }
}

fn sql_eq(column: &str, value: &str) -> String {
    let v = value.replace('\'', "''");
    format!("{column} = '{v}'")
}

fn table_schema(dims: i32) -> SchemaRef {
    let item = Field::new("item", DataType::Float32, true);
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("vector", DataType::FixedSizeList(Arc::new(item), dims), true),
        Field::new("importance", DataType::Float64, false),
        Field::new("category", DataType::Utf8, false),
        Field::new("created_at", DataType::Int64, false),
    ]))
}

fn build_batch(
    schema: SchemaRef,
    row: &StoredRow,
    vector: &[f32],
    dims: usize,
) -> Result<RecordBatch, MemoroError> {
    let mut vec_builder = FixedSizeListBuilder::new(Float32Builder::new(), dims as i32);
    vec_builder.values().append_slice(vector);
    vec_builder.append(true);

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(vec![Some(row.id.as_str())])),
            Arc::new(StringArray::from(vec![Some(row.text.as_str())])),
            Arc::new(vec_builder.finish()),
            Arc::new(Float64Array::from(vec![row.importance])),
            Arc::new(StringArray::from(vec![Some(row.category.as_str())])),
            Arc::new(Int64Array::from(vec![row.created_at])),
        ],
    )
    .map_err(|e| MemoroError::Internal(format!("record batch build failed: {e}")))
}

fn parse_rows_and_distances(batch: &RecordBatch) -> (Vec<StoredRow>, Vec<f64>) {
    let id = batch
        .column_by_name("id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let text = batch
        .column_by_name("text")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let importance = batch
        .column_by_name("importance")
        .and_then(|c| c.as_any().downcast_ref::<Float64Array>());
    let category = batch
        .column_by_name("category")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let created_at = batch
        .column_by_name("created_at")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
    let distance = batch
        .column_by_name(LANCE_DISTANCE_COL)
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    let (Some(id), Some(text)) = (id, text) else {
        return (Vec::new(), Vec::new());
    };

    let mut rows = Vec::with_capacity(batch.num_rows());
    let mut distances = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if id.is_null(i) || text.is_null(i) {
            continue;
        }
        rows.push(StoredRow {
            id: id.value(i).to_string(),
            text: text.value(i).to_string(),
            importance: importance.map_or(0.0, |col| col.value(i)),
            category: category
                .and_then(|col| (!col.is_null(i)).then(|| col.value(i).to_string()))
                .unwrap_or_else(|| "other".to_string()),
            created_at: created_at.map_or(0, |col| col.value(i)),
        });
        distances.push(distance.map_or(0.0, |col| f64::from(col.value(i))));
    }
    (rows, distances)
}

/// Project a stored row into the lexical entry shape.
fn row_to_shell(row: StoredRow) -> MemoryEntry {
    MemoryEntry {
        id: row.id,
        text: row.text,
        category: row.category.parse().unwrap_or(Category::Other),
        importance: row.importance,
        entity: None,
        key: None,
        value: None,
        source: "vector".to_string(),
        created_at: row.created_at,
        decay_class: DecayClass::Stable,
        expires_at: None,
        last_confirmed_at: row.created_at,
        confidence: 1.0,
        search_tags: String::new(),
    }
}

/// Vector store over a single LanceDB table.
///
/// Single-writer: callers must not interleave writes across processes.
pub struct VectorStore {
    table: Table,
    schema: SchemaRef,
    dims: usize,
    clock: Arc<dyn Clock>,
}

impl VectorStore {
    /// Connect to (or create) the `memories` table under `dir`.
    ///
    /// An existing table pins the dimension through its schema; a fresh one
    /// is created with a single seed row to fix the vector width, and the
    /// seed is deleted before the store is handed out.
    pub async fn open(
        dir: impl AsRef<Path>,
        dims: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MemoroError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(MemoroError::storage)?;
        let uri = dir.to_string_lossy().to_string();

        let conn = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| vector_err(format!("connect to {uri} failed"), e))?;

        let table = match conn.open_table(TABLE_NAME).execute().await {
            Ok(table) => table,
            Err(_) => {
                let schema = table_schema(dims as i32);
                let seed = StoredRow {
                    id: SEED_ID.to_string(),
                    text: String::new(),
                    importance: 0.0,
                    category: "other".to_string(),
                    created_at: 0,
                };
                let batch = build_batch(schema.clone(), &seed, &vec![0.0; dims], dims)?;
                let reader =
                    RecordBatchIterator::new([Ok(batch)].into_iter(), schema.clone());
                let table = conn
                    .create_table(TABLE_NAME, Box::new(reader))
                    .execute()
                    .await
                    .map_err(|e| vector_err("create memories table failed", e))?;
                table
                    .delete(&sql_eq("id", SEED_ID))
                    .await
                    .map_err(|e| vector_err("seed row cleanup failed", e))?;
                debug!(dims, "vector table created");
                table
            }
        };

        let schema = table
            .schema()
            .await
            .map_err(|e| vector_err("read table schema failed", e))?;
        let dims = match schema
            .field_with_name("vector")
            .map_err(|e| MemoroError::Internal(format!("vector column missing: {e}")))?
            .data_type()
        {
            DataType::FixedSizeList(_, n) => *n as usize,
            other => {
                return Err(MemoroError::Internal(format!(
                    "unexpected vector column type: {other:?}"
                )))
            }
        };

        Ok(Self {
            table,
            schema,
            dims,
            clock,
        })
    }

    /// Pinned vector dimension of the table.
    pub fn dimensions(&self) -> usize {
        self.dims
    }

    /// Upsert a record by id: best-effort delete of any existing row, then
    /// insert. Returns the (possibly generated) id.
    pub async fn store(&self, record: VectorRecord) -> Result<String, MemoroError> {
        if record.vector.len() != self.dims {
            return Err(MemoroError::Vector {
                message: format!(
                    "vector dimension mismatch: got {}, table holds {}",
                    record.vector.len(),
                    self.dims
                ),
                source: None,
            });
        }

        let id = record.id.unwrap_or_else(new_memory_id);
        if let Err(e) = self.table.delete(&sql_eq("id", &id)).await {
            debug!("pre-insert delete skipped: {e}");
        }

        let row = StoredRow {
            id: id.clone(),
            text: record.text,
            importance: record.importance,
            category: record.category.to_string(),
            created_at: self.clock.now(),
        };
        let batch = build_batch(self.schema.clone(), &row, &record.vector, self.dims)?;
        let reader = RecordBatchIterator::new([Ok(batch)].into_iter(), self.schema.clone());
        self.table
            .add(Box::new(reader))
            .execute()
            .await
            .map_err(|e| vector_err("vector insert failed", e))?;
        Ok(id)
    }

    /// k-NN search with `k = limit`, keeping rows whose
    /// `score = 1 / (1 + distance)` is at least `min_score`.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        min_score: f64,
    ) -> Result<Vec<SearchResult>, MemoroError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut stream = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(|e| vector_err("nearest-neighbor query build failed", e))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .map_err(|e| vector_err("vector search failed", e))?;

        let mut results = Vec::new();
        while let Some(batch) = stream
            .try_next()
            .await
            .map_err(|e| MemoroError::Internal(format!("vector result stream failed: {e}")))?
        {
            let (rows, distances) = parse_rows_and_distances(&batch);
            for (row, distance) in rows.into_iter().zip(distances) {
                let score = 1.0 / (1.0 + distance);
                if score >= min_score {
                    results.push(SearchResult {
                        entry: row_to_shell(row),
                        score,
                        backend: Backend::Lancedb,
                    });
                }
            }
        }

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(limit);
        Ok(results)
    }

    /// True when the nearest neighbor scores at or above `threshold`.
    pub async fn has_duplicate(
        &self,
        vector: &[f32],
        threshold: f64,
    ) -> Result<bool, MemoroError> {
        let nearest = self.search(vector, 1, 0.0).await?;
        Ok(nearest.first().is_some_and(|hit| hit.score >= threshold))
    }

    /// Delete by id. Ids that are not hex UUID-shaped are silently skipped.
    pub async fn delete(&self, id: &str) -> Result<(), MemoroError> {
        if !is_uuid_shaped(id) {
            debug!(id, "skipping vector delete for non-uuid id");
            return Ok(());
        }
        self.table
            .delete(&sql_eq("id", id))
            .await
            .map_err(|e| vector_err("vector delete failed", e))
    }

    /// Batch delete, continuing past per-id failures. Returns the number of
    /// delete calls that succeeded.
    pub async fn delete_many(&self, ids: &[String]) -> usize {
        let mut deleted = 0;
        for id in ids {
            if !is_uuid_shaped(id) {
                debug!(id, "skipping vector delete for non-uuid id");
                continue;
            }
            match self.table.delete(&sql_eq("id", id)).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(id, "vector delete failed: {e}"),
            }
        }
        deleted
    }

    /// Total rows in the table.
    pub async fn count(&self) -> Result<usize, MemoroError> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| vector_err("count failed", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoro_core::FixedClock;
    use tempfile::tempdir;

    const DIMS: usize = 4;

    async fn setup() -> (VectorStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(1_700_000_000));
        let store = VectorStore::open(dir.path(), DIMS, clock).await.unwrap();
        (store, dir)
    }

    fn record(id: Option<&str>, text: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.map(str::to_string),
            text: text.to_string(),
            vector,
            importance: 0.7,
            category: Category::Fact,
        }
    }

    #[tokio::test]
    async fn open_deletes_seed_row() {
        let (store, _dir) = setup().await;
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.dimensions(), DIMS);
    }

    #[tokio::test]
    async fn store_generates_id_and_search_finds_it() {
        let (store, _dir) = setup().await;
        let id = store
            .store(record(None, "gateway handles retries", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        assert!(is_uuid_shaped(&id));

        let results = store
            .search(&[1.0, 0.0, 0.0, 0.0], 5, DEFAULT_MIN_SCORE)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let hit = &results[0];
        assert_eq!(hit.entry.id, id);
        assert_eq!(hit.backend, Backend::Lancedb);
        // Identical vector: distance ~0, score ~1.
        assert!(hit.score > 0.99, "score was {}", hit.score);
        // Projection shell: no structured identity, stable class.
        assert_eq!(hit.entry.entity, None);
        assert_eq!(hit.entry.key, None);
        assert_eq!(hit.entry.value, None);
        assert_eq!(hit.entry.decay_class, DecayClass::Stable);
    }

    #[tokio::test]
    async fn store_upserts_by_id() {
        let (store, _dir) = setup().await;
        let id = new_memory_id();
        store
            .store(record(Some(&id), "first text", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        store
            .store(record(Some(&id), "second text", vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let results = store.search(&[0.0, 1.0, 0.0, 0.0], 1, 0.0).await.unwrap();
        assert_eq!(results[0].entry.text, "second text");
    }

    #[tokio::test]
    async fn search_filters_by_min_score() {
        let (store, _dir) = setup().await;
        store
            .store(record(None, "aligned", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        store
            .store(record(None, "orthogonal", vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();

        // Orthogonal cosine distance is 1.0 -> score 0.5; filter it out.
        let results = store.search(&[1.0, 0.0, 0.0, 0.0], 5, 0.9).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entry.text, "aligned");
    }

    #[tokio::test]
    async fn search_limit_bounds_results() {
        let (store, _dir) = setup().await;
        for i in 0..6 {
            let mut v = vec![1.0, 0.0, 0.0, 0.0];
            v[1] = i as f32 * 0.01;
            store.store(record(None, &format!("row {i}"), v)).await.unwrap();
        }
        let results = store.search(&[1.0, 0.0, 0.0, 0.0], 3, 0.0).await.unwrap();
        assert!(results.len() <= 3);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_is_rejected() {
        let (store, _dir) = setup().await;
        let err = store
            .store(record(None, "bad width", vec![1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoroError::Vector { .. }));
    }

    #[tokio::test]
    async fn has_duplicate_uses_threshold() {
        let (store, _dir) = setup().await;
        store
            .store(record(None, "existing", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        assert!(store
            .has_duplicate(&[1.0, 0.0, 0.0, 0.0], DEFAULT_DUPLICATE_THRESHOLD)
            .await
            .unwrap());
        assert!(!store
            .has_duplicate(&[0.0, 1.0, 0.0, 0.0], DEFAULT_DUPLICATE_THRESHOLD)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn has_duplicate_on_empty_table_is_false() {
        let (store, _dir) = setup().await;
        assert!(!store
            .has_duplicate(&[1.0, 0.0, 0.0, 0.0], DEFAULT_DUPLICATE_THRESHOLD)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_skips_non_uuid_ids() {
        let (store, _dir) = setup().await;
        let id = store
            .store(record(None, "kept", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();

        // Injection-shaped and malformed ids are no-ops, not errors.
        store.delete("not-a-uuid").await.unwrap();
        store.delete("x' OR '1'='1").await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete(&id).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_many_counts_only_valid_deletions() {
        let (store, _dir) = setup().await;
        let a = store
            .store(record(None, "a", vec![1.0, 0.0, 0.0, 0.0]))
            .await
            .unwrap();
        let b = store
            .store(record(None, "b", vec![0.0, 1.0, 0.0, 0.0]))
            .await
            .unwrap();

        let ids = vec![a, "garbage-id".to_string(), b];
        let deleted = store.delete_many(&ids).await;
        assert_eq!(deleted, 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reopen_derives_dims_from_existing_table() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(1_700_000_000));
        {
            let store = VectorStore::open(dir.path(), 8, clock.clone()).await.unwrap();
            store
                .store(record(None, "persisted", vec![0.5; 8]))
                .await
                .unwrap();
        }

        // Requested dims are ignored when the table already pins the width.
        let store = VectorStore::open(dir.path(), 99, clock).await.unwrap();
        assert_eq!(store.dimensions(), 8);
        assert_eq!(store.count().await.unwrap(), 1);
    }
}
