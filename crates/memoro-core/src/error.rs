// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for the memoro memory engine.

use thiserror::Error;

/// The primary error type used across all memoro crates.
#[derive(Debug, Error)]
pub enum MemoroError {
    /// Configuration errors (invalid TOML, missing required fields, type mismatches).
    #[error("configuration error: {0}")]
    Config(String),

    /// Lexical storage errors (database open, migration, query failure).
    ///
    /// Open and migration failures are fatal: the engine refuses to start.
    #[error("storage error: {source}")]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Vector store errors (connection, table, query failure). Recoverable:
    /// callers degrade to lexical-only behavior.
    #[error("vector store error: {message}")]
    Vector {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Embedding provider errors. Recoverable: recall degrades to
    /// lexical-only, ingest skips the vector write.
    #[error("embedding error: {message}")]
    Embedding {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Malformed caller input (bad id, empty checkpoint fields, forget with
    /// neither id nor query). Surfaced as a user-visible message; never persisted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Internal or unexpected errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoroError {
    /// Wrap an arbitrary error as a lexical storage failure.
    pub fn storage<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MemoroError::Storage {
            source: Box::new(source),
        }
    }

    /// Wrap an arbitrary error as a vector store failure.
    pub fn vector<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        MemoroError::Vector {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
