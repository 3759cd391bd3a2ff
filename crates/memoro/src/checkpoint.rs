// SPDX-FileCopyrightText: 2026 Memoro Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `memoro checkpoint` command implementation.

use clap::Subcommand;
use memoro_core::MemoroError;
use memoro_engine::MemoryEngine;

/// Checkpoint actions.
#[derive(Subcommand, Debug)]
pub enum CheckpointAction {
    /// Save the current pre-flight context.
    Save {
        /// What the work is trying to achieve.
        #[arg(long)]
        intent: Option<String>,
        /// Where the work currently stands.
        #[arg(long)]
        state: Option<String>,
        /// What success looks like.
        #[arg(long)]
        expected_outcome: Option<String>,
        /// Files in flight.
        #[arg(long)]
        working_files: Vec<String>,
    },
    /// Restore the most recent non-expired checkpoint.
    Restore,
}

/// Run the `memoro checkpoint` command.
pub async fn run_checkpoint(
    engine: &MemoryEngine,
    action: CheckpointAction,
) -> Result<(), MemoroError> {
    match action {
        CheckpointAction::Save {
            intent,
            state,
            expected_outcome,
            working_files,
        } => {
            let intent = intent.ok_or_else(|| {
                MemoroError::InvalidInput("checkpoint save requires --intent".to_string())
            })?;
            let state = state.ok_or_else(|| {
                MemoroError::InvalidInput("checkpoint save requires --state".to_string())
            })?;
            let files = (!working_files.is_empty()).then_some(working_files);
            let id = engine
                .checkpoint_save(&intent, &state, expected_outcome, files)
                .await?;
            println!("checkpoint saved: {id}");
            Ok(())
        }
        CheckpointAction::Restore => match engine.checkpoint_restore().await? {
            Some(ctx) => {
                println!("intent: {}", ctx.intent);
                println!("state:  {}", ctx.state);
                if let Some(expected) = &ctx.expected_outcome {
                    println!("expected outcome: {expected}");
                }
                if let Some(files) = &ctx.working_files {
                    println!("working files:");
                    for file in files {
                        println!("  {file}");
                    }
                }
                println!("saved at: {}", ctx.saved_at);
                Ok(())
            }
            None => {
                println!("no checkpoint to restore");
                Ok(())
            }
        },
    }
}
