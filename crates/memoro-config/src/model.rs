// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration model structs for the memoro memory engine.
//!
//! All structs use `#[serde(deny_unknown_fields)]` to reject unrecognized
//! config keys at startup, providing actionable error messages.

use serde::{Deserialize, Serialize};

/// Top-level memoro configuration.
///
/// Loaded from TOML files following XDG hierarchy, with environment variable
/// overrides. All sections are optional and default to sensible values.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoroConfig {
    /// On-disk locations for both stores.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Recall, dedup and maintenance tuning.
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Embedding provider settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Markdown note ingestion settings.
    #[serde(default)]
    pub notes: NotesConfig,
}

/// On-disk locations for the lexical database and the vector directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root data directory. Parent directories are created on open.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Lexical SQLite database file name, under `data_dir`.
    #[serde(default = "default_lexical_file")]
    pub lexical_file: String,

    /// LanceDB directory name, under `data_dir`.
    #[serde(default = "default_vector_dir")]
    pub vector_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            lexical_file: default_lexical_file(),
            vector_dir: default_vector_dir(),
        }
    }
}

fn default_data_dir() -> String {
    dirs::data_dir()
        .map(|d| d.join("memoro").to_string_lossy().to_string())
        .unwrap_or_else(|| ".memoro".to_string())
}

fn default_lexical_file() -> String {
    "memories.db".to_string()
}

fn default_vector_dir() -> String {
    "lancedb".to_string()
}

/// Recall, dedup and maintenance tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Default number of results returned by recall.
    #[serde(default = "default_recall_limit")]
    pub recall_limit: usize,

    /// Minimum vector score (1/(1+distance)) kept by vector search.
    #[serde(default = "default_min_vector_score")]
    pub min_vector_score: f64,

    /// Nearest-neighbor score above which a vector write is a duplicate.
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f64,

    /// Seconds between maintenance ticks (hard prune + soft decay).
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Maximum auto-captured memories per agent turn.
    #[serde(default = "default_auto_capture_max")]
    pub auto_capture_max: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            recall_limit: default_recall_limit(),
            min_vector_score: default_min_vector_score(),
            duplicate_threshold: default_duplicate_threshold(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            auto_capture_max: default_auto_capture_max(),
        }
    }
}

fn default_recall_limit() -> usize {
    5
}

fn default_min_vector_score() -> f64 {
    0.3
}

fn default_duplicate_threshold() -> f64 {
    0.95
}

fn default_maintenance_interval_secs() -> u64 {
    3_600
}

fn default_auto_capture_max() -> usize {
    3
}

/// Embedding provider settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    /// Model name; decides the vector dimension unless `dimensions` overrides it.
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Explicit dimension override. `None` derives it from `model`.
    #[serde(default)]
    pub dimensions: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimensions: None,
        }
    }
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}

/// Markdown note ingestion settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct NotesConfig {
    /// Directory holding daily `YYYY-MM-DD.md` notes.
    #[serde(default = "default_notes_dir")]
    pub dir: String,

    /// Long-lived memory file ingested on every startup sweep.
    #[serde(default = "default_memory_file")]
    pub memory_file: String,

    /// How many trailing days of daily notes the startup sweep ingests.
    #[serde(default = "default_markdown_days")]
    pub days: u32,
}

impl Default for NotesConfig {
    fn default() -> Self {
        Self {
            dir: default_notes_dir(),
            memory_file: default_memory_file(),
            days: default_markdown_days(),
        }
    }
}

fn default_notes_dir() -> String {
    "notes".to_string()
}

fn default_memory_file() -> String {
    "MEMORY.md".to_string()
}

fn default_markdown_days() -> u32 {
    3
}
