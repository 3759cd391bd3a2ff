// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration loader using Figment for layered config merging.
//!
//! Supports XDG hierarchy: `./memoro.toml` > `~/.config/memoro/memoro.toml` >
//! `/etc/memoro/memoro.toml` with environment variable overrides via the
//! `MEMORO_` prefix.

#![allow(clippy::result_large_err)] // figment::Error is external and cannot be boxed without wrapper

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

use crate::model::MemoroConfig;

/// Load configuration from the standard XDG hierarchy with env var overrides.
///
/// Merge order (later overrides earlier):
/// 1. Compiled defaults
/// 2. `/etc/memoro/memoro.toml` (system-wide)
/// 3. `~/.config/memoro/memoro.toml` (user XDG config)
/// 4. `./memoro.toml` (local directory)
/// 5. `MEMORO_*` environment variables
pub fn load_config() -> Result<MemoroConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(MemoroConfig::default()))
        .merge(Toml::file("/etc/memoro/memoro.toml"))
        .merge(Toml::file(
            dirs::config_dir()
                .map(|d| d.join("memoro/memoro.toml"))
                .unwrap_or_default(),
        ))
        .merge(Toml::file("memoro.toml"))
        .merge(env_provider())
        .extract()
}

/// Load configuration from TOML content only (no XDG lookup, no env).
///
/// Used for testing and explicit config specification.
pub fn load_config_from_str(toml_content: &str) -> Result<MemoroConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(MemoroConfig::default()))
        .merge(Toml::string(toml_content))
        .extract()
}

/// Load configuration from a specific file path with env var overrides.
pub fn load_config_from_path(path: &Path) -> Result<MemoroConfig, figment::Error> {
    Figment::new()
        .merge(Serialized::defaults(MemoroConfig::default()))
        .merge(Toml::file(path))
        .merge(env_provider())
        .extract()
}

/// Create the environment variable provider using explicit `map()` for
/// section-to-dot mapping.
///
/// Uses `Env::map()` NOT `Env::split("_")` to avoid ambiguity with
/// underscore-containing key names: `MEMORO_MEMORY_RECALL_LIMIT` must map to
/// `memory.recall_limit`, not `memory.recall.limit`.
fn env_provider() -> Env {
    Env::prefixed("MEMORO_").map(|key| {
        let key_str = key.as_str();
        let mapped = key_str
            .replacen("storage_", "storage.", 1)
            .replacen("memory_", "memory.", 1)
            .replacen("embedding_", "embedding.", 1)
            .replacen("notes_", "notes.", 1);
        mapped.into()
    })
}
