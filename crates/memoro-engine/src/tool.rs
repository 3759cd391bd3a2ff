// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tool trait, registry, and the five memory tools.
//!
//! The [`Tool`] trait is the transport-agnostic surface an agent runtime
//! binds to. The registry generates Anthropic-format tool definitions for
//! the provider request. Internal errors are converted into result envelopes
//! (`{content, details}` with `is_error` set) rather than escaping; only the
//! storage layer's fatal open errors ever surface as Rust errors, and those
//! happen before any tool exists.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use memoro_core::{Category, DecayClass, MemoroError, MemoryCandidate, SearchResult};
use serde_json::json;

use crate::engine::{ForgetOutcome, ForgetRequest, MemoryEngine, PruneMode};

/// Output from a tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// The content returned by the tool (JSON text).
    pub content: String,
    /// Whether the invocation resulted in an error.
    pub is_error: bool,
}

/// Unified trait for all tools the memory plugin exposes.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The tool's unique name (used for lookup and API serialization).
    fn name(&self) -> &str;

    /// Human-readable description of what the tool does.
    fn description(&self) -> &str;

    /// JSON Schema describing the tool's input parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Invoke the tool with the parsed JSON input.
    async fn invoke(&self, input: serde_json::Value) -> ToolOutput;
}

/// Registry of available tools, indexed by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// A registry pre-populated with the five memory tools.
    pub fn with_memory_tools(engine: Arc<MemoryEngine>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RecallTool(engine.clone())));
        registry.register(Arc::new(StoreTool(engine.clone())));
        registry.register(Arc::new(ForgetTool(engine.clone())));
        registry.register(Arc::new(CheckpointTool(engine.clone())));
        registry.register(Arc::new(PruneTool(engine)));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Anthropic-format tool definitions, sorted by name.
    pub fn tool_definitions(&self) -> Vec<serde_json::Value> {
        let mut defs: Vec<serde_json::Value> = self
            .tools
            .values()
            .map(|t| {
                json!({
                    "name": t.name(),
                    "description": t.description(),
                    "input_schema": t.parameters_schema(),
                })
            })
            .collect();
        defs.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or("")
                .cmp(b["name"].as_str().unwrap_or(""))
        });
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert an internal error into a result envelope.
fn error_output(e: &MemoroError) -> ToolOutput {
    ToolOutput {
        content: json!({
            "content": e.to_string(),
            "details": format!("{e:?}"),
        })
        .to_string(),
        is_error: true,
    }
}

fn ok_output(value: serde_json::Value) -> ToolOutput {
    ToolOutput {
        content: value.to_string(),
        is_error: false,
    }
}

fn results_json(results: &[SearchResult]) -> serde_json::Value {
    json!(results
        .iter()
        .map(|r| {
            json!({
                "id": r.entry.id,
                "text": r.entry.text,
                "category": r.entry.category.to_string(),
                "entity": r.entry.entity,
                "importance": r.entry.importance,
                "score": r.score,
                "backend": r.backend.as_str(),
            })
        })
        .collect::<Vec<_>>())
}

// --- memory_recall -----------------------------------------------------------

struct RecallTool(Arc<MemoryEngine>);

#[async_trait]
impl Tool for RecallTool {
    fn name(&self) -> &str {
        "memory_recall"
    }

    fn description(&self) -> &str {
        "Search long-term memory with hybrid keyword and semantic recall"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to recall" },
                "limit": { "type": "integer", "default": 5 },
                "entity": { "type": "string", "description": "Optional entity to look up directly" }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> ToolOutput {
        let Some(query) = input["query"].as_str() else {
            return error_output(&MemoroError::InvalidInput(
                "memory_recall requires a query".to_string(),
            ));
        };
        let limit = input["limit"].as_u64().unwrap_or(5) as usize;
        let entity = input["entity"].as_str();

        match self.0.recall(query, limit, entity).await {
            Ok(results) => ok_output(results_json(&results)),
            Err(e) => error_output(&e),
        }
    }
}

// --- memory_store ------------------------------------------------------------

struct StoreTool(Arc<MemoryEngine>);

#[async_trait]
impl Tool for StoreTool {
    fn name(&self) -> &str {
        "memory_store"
    }

    fn description(&self) -> &str {
        "Persist a statement in long-term memory, extracting structure when possible"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "text": { "type": "string" },
                "importance": { "type": "number", "default": 0.7 },
                "category": { "type": "string", "enum": ["preference", "decision", "entity", "fact", "other"] },
                "entity": { "type": "string" },
                "key": { "type": "string" },
                "value": { "type": "string" },
                "decayClass": { "type": "string", "enum": ["permanent", "stable", "active", "session", "checkpoint"] }
            },
            "required": ["text"]
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> ToolOutput {
        let Some(text) = input["text"].as_str() else {
            return error_output(&MemoroError::InvalidInput(
                "memory_store requires text".to_string(),
            ));
        };

        let category = input["category"]
            .as_str()
            .and_then(|s| Category::from_str(s).ok());
        let decay_class = input["decayClass"]
            .as_str()
            .and_then(|s| DecayClass::from_str(s).ok());

        let candidate = MemoryCandidate {
            importance: input["importance"].as_f64().unwrap_or(0.7),
            category,
            entity: input["entity"].as_str().map(str::to_string),
            key: input["key"].as_str().map(str::to_string),
            value: input["value"].as_str().map(str::to_string),
            decay_class,
            ..MemoryCandidate::from_text(text.to_string())
        };

        match self.0.store(candidate).await {
            Ok(outcome) => ok_output(serde_json::to_value(&outcome).unwrap_or_default()),
            Err(e) => error_output(&e),
        }
    }
}

// --- memory_forget -----------------------------------------------------------

struct ForgetTool(Arc<MemoryEngine>);

#[async_trait]
impl Tool for ForgetTool {
    fn name(&self) -> &str {
        "memory_forget"
    }

    fn description(&self) -> &str {
        "Delete a memory by id, or list deletion candidates for a query"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "memoryId": { "type": "string", "description": "UUID of the memory to delete" },
                "query": { "type": "string", "description": "Search text when the id is unknown" }
            }
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> ToolOutput {
        let request = if let Some(id) = input["memoryId"].as_str() {
            ForgetRequest::ById(id.to_string())
        } else if let Some(query) = input["query"].as_str() {
            ForgetRequest::ByQuery(query.to_string())
        } else {
            return error_output(&MemoroError::InvalidInput(
                "memory_forget requires memoryId or query".to_string(),
            ));
        };

        match self.0.forget(request).await {
            Ok(ForgetOutcome::Deleted { id }) => {
                ok_output(json!({ "deleted": true, "id": id }))
            }
            Ok(ForgetOutcome::NotFound { id }) => {
                ok_output(json!({ "deleted": false, "id": id }))
            }
            Ok(ForgetOutcome::Candidates(candidates)) => {
                ok_output(json!({ "candidates": results_json(&candidates) }))
            }
            Err(e) => error_output(&e),
        }
    }
}

// --- memory_checkpoint -------------------------------------------------------

struct CheckpointTool(Arc<MemoryEngine>);

#[async_trait]
impl Tool for CheckpointTool {
    fn name(&self) -> &str {
        "memory_checkpoint"
    }

    fn description(&self) -> &str {
        "Save or restore a short-lived pre-flight context checkpoint"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": { "type": "string", "enum": ["save", "restore"] },
                "intent": { "type": "string" },
                "state": { "type": "string" },
                "expectedOutcome": { "type": "string" },
                "workingFiles": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["action"]
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> ToolOutput {
        match input["action"].as_str() {
            Some("save") => {
                let intent = input["intent"].as_str().unwrap_or_default();
                let state = input["state"].as_str().unwrap_or_default();
                let expected = input["expectedOutcome"].as_str().map(str::to_string);
                let files = input["workingFiles"].as_array().map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                });
                match self.0.checkpoint_save(intent, state, expected, files).await {
                    Ok(id) => ok_output(json!({ "saved": true, "id": id })),
                    Err(e) => error_output(&e),
                }
            }
            Some("restore") => match self.0.checkpoint_restore().await {
                Ok(Some(ctx)) => ok_output(json!({ "restored": true, "context": ctx })),
                Ok(None) => ok_output(json!({ "restored": false })),
                Err(e) => error_output(&e),
            },
            _ => error_output(&MemoroError::InvalidInput(
                "memory_checkpoint action must be save or restore".to_string(),
            )),
        }
    }
}

// --- memory_prune ------------------------------------------------------------

struct PruneTool(Arc<MemoryEngine>);

#[async_trait]
impl Tool for PruneTool {
    fn name(&self) -> &str {
        "memory_prune"
    }

    fn description(&self) -> &str {
        "Run hard expiry pruning and/or soft confidence decay"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "mode": { "type": "string", "enum": ["hard", "soft", "both"], "default": "both" }
            }
        })
    }

    async fn invoke(&self, input: serde_json::Value) -> ToolOutput {
        let mode = input["mode"]
            .as_str()
            .and_then(|s| PruneMode::from_str(s).ok())
            .unwrap_or(PruneMode::Both);

        match self.0.prune(mode).await {
            Ok(outcome) => ok_output(json!({
                "hardRemoved": outcome.hard_removed,
                "vectorRemoved": outcome.vector_removed,
                "softTouched": outcome.soft_touched,
            })),
            Err(e) => error_output(&e),
        }
    }
}
