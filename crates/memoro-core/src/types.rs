// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Domain types for the memoro memory engine.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Default importance assigned to memories when the caller supplies none.
pub const DEFAULT_IMPORTANCE: f64 = 0.7;

/// Floor below which soft decay never pushes confidence.
pub const MIN_CONFIDENCE: f64 = 0.05;

/// Lifecycle bucket controlling TTL and refresh policy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DecayClass {
    /// Never expires; never refreshed or pruned.
    Permanent,
    /// Long-lived fact; access refresh extends expiry by 90 days.
    Stable,
    /// In-flight work item; access refresh extends expiry by 14 days.
    Active,
    /// Scratch state for the current session; 24 hours, not refreshed.
    Session,
    /// Pre-flight context blob; 4 hours, not refreshed.
    Checkpoint,
}

impl DecayClass {
    /// TTL in seconds, or `None` for permanent.
    pub fn ttl_seconds(&self) -> Option<i64> {
        match self {
            DecayClass::Permanent => None,
            DecayClass::Stable => Some(90 * 86_400),
            DecayClass::Active => Some(14 * 86_400),
            DecayClass::Session => Some(24 * 3_600),
            DecayClass::Checkpoint => Some(4 * 3_600),
        }
    }

    /// Whether a recall access extends this class's expiry.
    pub fn refresh_on_access(&self) -> bool {
        matches!(self, DecayClass::Stable | DecayClass::Active)
    }
}

/// Broad content category assigned at capture time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Preference,
    Decision,
    Entity,
    Fact,
    Other,
}

/// Which index produced a search result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// The SQLite FTS5 lexical index.
    Sqlite,
    /// The LanceDB vector index.
    Lancedb,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Lancedb => "lancedb",
        }
    }
}

/// One persisted memory record.
///
/// The lexical store owns the authoritative copy; the vector store holds a
/// projection of a subset of these fields. `expires_at = None` if and only if
/// `decay_class` is [`DecayClass::Permanent`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Opaque identifier, stable across upserts (UUID v4 string).
    pub id: String,
    /// Original natural-language statement.
    pub text: String,
    pub category: Category,
    /// Caller-supplied weight in [0,1].
    pub importance: f64,
    /// Optional structured identity; `(entity, key)` acts as the
    /// case-insensitive upsert key when both are set.
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    /// Provenance tag (conversation, auto-capture, checkpoint, markdown:...).
    pub source: String,
    /// Seconds since epoch when the current revision was written.
    pub created_at: i64,
    pub decay_class: DecayClass,
    /// Absolute expiry in seconds since epoch; `None` means never.
    pub expires_at: Option<i64>,
    /// Seconds since epoch of the last write or access refresh.
    pub last_confirmed_at: i64,
    /// Soft-decayed belief strength in [0.05, 1.0].
    pub confidence: f64,
    /// Space-joined synonym expansion indexed alongside the text.
    pub search_tags: String,
}

/// A memory entry with a retrieval score and originating backend.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub entry: MemoryEntry,
    pub score: f64,
    pub backend: Backend,
}

/// Caller input to `store`. Fields left `None` are filled by the extractor,
/// decay classifier and synonym expander.
#[derive(Debug, Clone)]
pub struct MemoryCandidate {
    pub text: String,
    pub importance: f64,
    pub category: Option<Category>,
    pub entity: Option<String>,
    pub key: Option<String>,
    pub value: Option<String>,
    pub source: String,
    pub decay_class: Option<DecayClass>,
    pub expires_at: Option<i64>,
    pub search_tags: Option<String>,
}

impl MemoryCandidate {
    /// A candidate carrying only text, with conversation provenance.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            importance: DEFAULT_IMPORTANCE,
            category: None,
            entity: None,
            key: None,
            value: None,
            source: "conversation".to_string(),
            decay_class: None,
            expires_at: None,
            search_tags: None,
        }
    }
}

/// Outcome of a facade-level `store` call.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum StoreOutcome {
    /// A new record was written (or an existing `(entity, key)` row upserted).
    Created {
        id: String,
        #[serde(rename = "decayClass")]
        decay_class: DecayClass,
    },
    /// Identical text already exists; nothing was written.
    Duplicate,
}

/// Rows removed by a hard prune, with ids for vector-store mirroring.
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub count: usize,
    pub ids: Vec<String>,
}

/// Pre-flight context blob persisted as a checkpoint record.
///
/// Serialized as the `text` of a lexical record with `entity = "system"` and
/// `key = "checkpoint:<now>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointContext {
    pub intent: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_outcome: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_files: Option<Vec<String>>,
    pub saved_at: i64,
}

/// Generate a fresh record id.
pub fn new_memory_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// True if `id` is a hex UUID-shaped string (8-4-4-4-12 hex groups).
///
/// The vector store refuses to interpolate anything else into delete
/// predicates.
pub fn is_uuid_shaped(id: &str) -> bool {
    let groups: Vec<&str> = id.split('-').collect();
    if groups.len() != 5 {
        return false;
    }
    let widths = [8, 4, 4, 4, 12];
    groups
        .iter()
        .zip(widths.iter())
        .all(|(g, w)| g.len() == *w && g.chars().all(|c| c.is_ascii_hexdigit()))
}
