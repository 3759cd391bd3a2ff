// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Layered TOML configuration for the memoro memory engine.
//!
//! Config is merged from compiled defaults, system and XDG config files, a
//! local `memoro.toml`, and `MEMORO_*` environment variables.

pub mod loader;
pub mod model;

pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::{EmbeddingConfig, MemoroConfig, MemoryConfig, NotesConfig, StorageConfig};
