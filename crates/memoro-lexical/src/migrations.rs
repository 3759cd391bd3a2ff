// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ordered, idempotent schema migrations gated by the `_meta` table.
//!
//! Every step either probes current schema state or checks a `_meta` version
//! marker before acting, so re-running the full chain on an already-migrated
//! database is a no-op. Foreign readers must not bypass these markers:
//! `fts_version=3` pins the stemming tokenizer and the `search_tags` column,
//! `nocase_index=1` pins the case-insensitive entity index.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::info;

/// Current FTS index generation (porter + unicode61 + remove_diacritics,
/// with `search_tags` indexed).
const FTS_VERSION: &str = "3";

/// Run all pending migrations. Called on every open.
pub fn run_migrations(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    base_schema(conn)?;
    add_decay_columns(conn)?;
    convert_ms_timestamps(conn)?;
    rebuild_fts(conn)?;
    dedupe_entity_key(conn)?;
    backfill_expiries(conn)?;
    secondary_indexes(conn)?;
    nocase_entity_index(conn)?;
    Ok(())
}

fn meta_get(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT value FROM _meta WHERE key = ?1")?;
    match stmt.query_row(params![key], |row| row.get::<_, String>(0)) {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

fn meta_set(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO _meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

/// Record table and `_meta` table.
fn base_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY NOT NULL,
            text TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT 'other',
            importance REAL NOT NULL DEFAULT 0.7,
            entity TEXT,
            key TEXT,
            value TEXT,
            source TEXT NOT NULL DEFAULT 'conversation',
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS _meta (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );",
    )
}

/// Add the decay columns when missing and seed `last_confirmed_at`.
///
/// Pre-decay databases have none of these columns; fresh databases get them
/// all here so every later step can assume their presence.
fn add_decay_columns(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let existing: HashSet<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(memories)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<HashSet<_>, _>>()?;
        names
    };

    let tx = conn.transaction()?;
    let additions: &[(&str, &str)] = &[
        ("decay_class", "TEXT NOT NULL DEFAULT 'stable'"),
        ("expires_at", "INTEGER"),
        ("last_confirmed_at", "INTEGER NOT NULL DEFAULT 0"),
        ("confidence", "REAL NOT NULL DEFAULT 1.0"),
        ("search_tags", "TEXT NOT NULL DEFAULT ''"),
    ];
    let mut added = false;
    for (name, decl) in additions {
        if !existing.contains(*name) {
            tx.execute_batch(&format!("ALTER TABLE memories ADD COLUMN {name} {decl};"))?;
            added = true;
        }
    }
    tx.execute(
        "UPDATE memories SET last_confirmed_at = created_at WHERE last_confirmed_at = 0",
        [],
    )?;
    tx.commit()?;

    if added {
        info!("migration: decay columns added");
    }
    Ok(())
}

/// Convert legacy millisecond timestamps (values > 10^12) to seconds.
fn convert_ms_timestamps(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut converted = 0;
    for column in ["created_at", "expires_at", "last_confirmed_at"] {
        converted += tx.execute(
            &format!(
                "UPDATE memories SET {column} = {column} / 1000
                 WHERE {column} IS NOT NULL AND {column} > 1000000000000"
            ),
            [],
        )?;
    }
    tx.commit()?;
    if converted > 0 {
        info!(rows = converted, "migration: millisecond timestamps converted");
    }
    Ok(())
}

/// Rebuild the FTS index with the stemming, diacritic-folding tokenizer and
/// the `search_tags` column. Gated by `fts_version`.
fn rebuild_fts(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    if meta_get(conn, "fts_version")?.as_deref() == Some(FTS_VERSION) {
        return Ok(());
    }

    let tx = conn.transaction()?;
    tx.execute_batch(
        "DROP TRIGGER IF EXISTS memories_ai;
         DROP TRIGGER IF EXISTS memories_ad;
         DROP TRIGGER IF EXISTS memories_au;
         DROP TABLE IF EXISTS memories_fts;

         CREATE VIRTUAL TABLE memories_fts USING fts5(
             text,
             category,
             entity,
             key,
             value,
             search_tags,
             content='memories',
             content_rowid='rowid',
             tokenize='porter unicode61 remove_diacritics 2'
         );

         CREATE TRIGGER memories_ai AFTER INSERT ON memories BEGIN
             INSERT INTO memories_fts(rowid, text, category, entity, key, value, search_tags)
                 VALUES (new.rowid, new.text, new.category, new.entity, new.key, new.value, new.search_tags);
         END;

         CREATE TRIGGER memories_ad AFTER DELETE ON memories BEGIN
             INSERT INTO memories_fts(memories_fts, rowid, text, category, entity, key, value, search_tags)
                 VALUES('delete', old.rowid, old.text, old.category, old.entity, old.key, old.value, old.search_tags);
         END;

         CREATE TRIGGER memories_au AFTER UPDATE ON memories BEGIN
             INSERT INTO memories_fts(memories_fts, rowid, text, category, entity, key, value, search_tags)
                 VALUES('delete', old.rowid, old.text, old.category, old.entity, old.key, old.value, old.search_tags);
             INSERT INTO memories_fts(rowid, text, category, entity, key, value, search_tags)
                 VALUES (new.rowid, new.text, new.category, new.entity, new.key, new.value, new.search_tags);
         END;

         INSERT INTO memories_fts(rowid, text, category, entity, key, value, search_tags)
             SELECT rowid, text, category, entity, key, value, search_tags FROM memories;",
    )?;
    meta_set(&tx, "fts_version", FTS_VERSION)?;
    tx.commit()?;

    info!(version = FTS_VERSION, "migration: FTS index rebuilt");
    Ok(())
}

/// Remove older duplicates per lowercased `(entity, key)` pair, then enforce
/// uniqueness with a partial index. Latest row (by `created_at`, `rowid` as
/// tiebreak) wins.
fn dedupe_entity_key(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    let removed = tx.execute(
        "DELETE FROM memories
         WHERE entity IS NOT NULL AND key IS NOT NULL
           AND rowid NOT IN (
               SELECT keep FROM (
                   SELECT rowid AS keep, MAX(created_at)
                   FROM memories
                   WHERE entity IS NOT NULL AND key IS NOT NULL
                   GROUP BY lower(entity), lower(key)
               )
           )",
        [],
    )?;
    tx.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_entity_key
             ON memories(lower(entity), lower(key))
             WHERE entity IS NOT NULL AND key IS NOT NULL;",
    )?;
    tx.commit()?;

    if removed > 0 {
        info!(rows = removed, "migration: duplicate (entity, key) rows removed");
    }
    Ok(())
}

/// Backfill null expiries on non-permanent rows from the current TTL table.
fn backfill_expiries(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let tx = conn.transaction()?;
    let updated = tx.execute(
        "UPDATE memories SET expires_at = created_at + CASE decay_class
             WHEN 'stable' THEN 7776000
             WHEN 'active' THEN 1209600
             WHEN 'session' THEN 86400
             WHEN 'checkpoint' THEN 14400
         END
         WHERE expires_at IS NULL AND decay_class != 'permanent'",
        [],
    )?;
    tx.commit()?;
    if updated > 0 {
        info!(rows = updated, "migration: null expiries backfilled");
    }
    Ok(())
}

/// Plain secondary indexes used by lookups, prune scans and stats.
fn secondary_indexes(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_memories_category ON memories(category);
         CREATE INDEX IF NOT EXISTS idx_memories_expires ON memories(expires_at)
             WHERE expires_at IS NOT NULL;
         CREATE INDEX IF NOT EXISTS idx_memories_decay_class ON memories(decay_class);",
    )
}

/// Replace the legacy case-sensitive entity index with a `lower(entity)`
/// expression index. Gated by `nocase_index`.
fn nocase_entity_index(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    if meta_get(conn, "nocase_index")?.as_deref() == Some("1") {
        return Ok(());
    }

    let tx = conn.transaction()?;
    // Dedup again under case folding: legacy case-sensitive stores can hold
    // pairs that collide only once entity comparison ignores case.
    tx.execute(
        "DELETE FROM memories
         WHERE entity IS NOT NULL AND key IS NOT NULL
           AND rowid NOT IN (
               SELECT keep FROM (
                   SELECT rowid AS keep, MAX(created_at)
                   FROM memories
                   WHERE entity IS NOT NULL AND key IS NOT NULL
                   GROUP BY lower(entity), lower(key)
               )
           )",
        [],
    )?;
    tx.execute_batch(
        "DROP INDEX IF EXISTS idx_memories_entity;
         CREATE INDEX IF NOT EXISTS idx_memories_entity_nocase ON memories(lower(entity));",
    )?;
    meta_set(&tx, "nocase_index", "1")?;
    tx.commit()?;

    info!("migration: case-insensitive entity index in place");
    Ok(())
}
