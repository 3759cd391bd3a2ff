// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All writes are serialized through tokio-rusqlite's single background
//! thread, which permits concurrent readers under WAL. Do NOT create
//! additional Connection instances for writes.

use std::path::Path;

use memoro_core::MemoroError;
use tokio_rusqlite::Connection;
use tracing::debug;

/// Convert tokio_rusqlite errors into the workspace storage error.
pub(crate) fn map_tr_err(e: tokio_rusqlite::Error) -> MemoroError {
    MemoroError::Storage {
        source: Box::new(e),
    }
}

/// Owned handle to the lexical SQLite database.
///
/// Opening runs PRAGMA setup and all pending migrations; a migration failure
/// is fatal and the store refuses to start.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (creating directories and the file as needed) and migrate.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, MemoroError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(MemoroError::storage)?;
            }
        }

        let conn = Connection::open(path.to_path_buf())
            .await
            .map_err(map_tr_err)?;
        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;",
            )?;
            crate::migrations::run_migrations(conn)?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        debug!(path = %path.display(), "lexical database opened");
        Ok(Self { conn })
    }

    /// The underlying serialized connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Checkpoint the WAL ahead of shutdown.
    pub async fn close(&self) -> Result<(), MemoroError> {
        self.conn
            .call(|conn| {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_missing_directories() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c/memories.db");
        let db = Database::open(&nested).await.unwrap();
        assert!(nested.exists(), "database file should be created");
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memories.db");

        let db = Database::open(&path).await.unwrap();
        db.close().await.unwrap();
        drop(db);

        // Second open re-runs migrations; all steps must be no-ops.
        let db = Database::open(&path).await.unwrap();
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn wal_mode_is_active() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("m.db")).await.unwrap();
        let mode: String = db
            .connection()
            .call(|conn| {
                let mode =
                    conn.query_row("PRAGMA journal_mode;", [], |row| row.get::<_, String>(0))?;
                Ok(mode)
            })
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
