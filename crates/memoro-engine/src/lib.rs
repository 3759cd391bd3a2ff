// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memory engine facade for memoro.
//!
//! Wires the extractor, lexical store, embedder and vector store into the
//! five memory operations (recall, store, forget, checkpoint, prune), the
//! hybrid result fuser, the agent lifecycle hooks, the markdown ingester,
//! the scheduled maintenance loop, and the tool surface agents bind to.

pub mod engine;
pub mod fuse;
pub mod hooks;
pub mod ingest;
pub mod maintenance;
pub mod tool;

pub use engine::{ForgetOutcome, ForgetRequest, MemoryEngine, PruneMode, PruneOutcome};
pub use fuse::merge_results;
pub use ingest::{IngestReport, MarkdownIngester};
pub use maintenance::MaintenanceRunner;
pub use tool::{Tool, ToolOutput, ToolRegistry};
