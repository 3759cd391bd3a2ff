// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! memoro - a long-lived memory store for conversational agents.
//!
//! Binary entry point: one subcommand group over the memory engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use memoro_config::MemoroConfig;
use memoro_core::{vector_dims_for_model, HashEmbedder, MemoroError, SystemClock};
use memoro_engine::MemoryEngine;
use tracing_subscriber::EnvFilter;

mod checkpoint;
mod maintain;
mod recall;
mod stats;

/// memoro - a long-lived memory store for conversational agents.
#[derive(Parser, Debug)]
#[command(name = "memoro", version, about, long_about = None)]
struct Cli {
    /// Load configuration from this file instead of the XDG hierarchy.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Show record counts and the decay-class breakdown.
    Stats {
        /// Emit structured JSON for scripting.
        #[arg(long)]
        json: bool,
        /// Disable colored output.
        #[arg(long)]
        plain: bool,
    },
    /// Hybrid search over stored memories.
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Case-insensitive entity lookup.
    Lookup {
        entity: String,
        #[arg(long)]
        key: Option<String>,
    },
    /// Remove expired rows and/or decay confidence.
    Prune {
        /// Hard prune only (expired-row deletion).
        #[arg(long, conflicts_with = "soft")]
        hard: bool,
        /// Soft decay only (confidence interpolation).
        #[arg(long)]
        soft: bool,
        /// Report what a hard prune would remove without deleting.
        #[arg(long)]
        dry_run: bool,
    },
    /// Save or restore a pre-flight checkpoint.
    Checkpoint {
        #[command(subcommand)]
        action: checkpoint::CheckpointAction,
    },
    /// Re-run the decay classifier over stale rows.
    BackfillDecay,
    /// Ingest recent daily markdown notes and the memory file.
    ExtractDaily {
        #[arg(long, default_value_t = 3)]
        days: u32,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<MemoroConfig, MemoroError> {
    let loaded = match path {
        Some(path) => memoro_config::load_config_from_path(path),
        None => memoro_config::load_config(),
    };
    loaded.map_err(|e| MemoroError::Config(e.to_string()))
}

async fn open_engine(config: &MemoroConfig) -> Result<Arc<MemoryEngine>, MemoroError> {
    let dims = config
        .embedding
        .dimensions
        .unwrap_or_else(|| vector_dims_for_model(&config.embedding.model));
    let embedder = Arc::new(HashEmbedder::new(dims));
    let engine = MemoryEngine::open(config, embedder, Arc::new(SystemClock)).await?;
    Ok(Arc::new(engine))
}

async fn run(cli: Cli) -> Result<(), MemoroError> {
    let config = load_config(cli.config.as_ref())?;
    let engine = open_engine(&config).await?;

    let result = match cli.command {
        Commands::Stats { json, plain } => stats::run_stats(&engine, json, plain).await,
        Commands::Search { query, limit } => recall::run_search(&engine, &query, limit).await,
        Commands::Lookup { entity, key } => {
            recall::run_lookup(&engine, &entity, key.as_deref()).await
        }
        Commands::Prune {
            hard,
            soft,
            dry_run,
        } => maintain::run_prune(&engine, hard, soft, dry_run).await,
        Commands::Checkpoint { action } => checkpoint::run_checkpoint(&engine, action).await,
        Commands::BackfillDecay => maintain::run_backfill(&engine).await,
        Commands::ExtractDaily { days } => {
            maintain::run_extract_daily(&engine, &config, days).await
        }
    };

    engine.close().await?;
    result
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
