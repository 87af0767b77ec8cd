// ABOUTME: Status command - prints the checkpoint of every configured table
// ABOUTME: Tables that were never committed are listed as such

use anyhow::{Context, Result};
use clap::Args;

use super::{load_config, ConfigArgs};
use crate::checkpoint::{AnyStore, CheckpointStore};

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn command(args: StatusArgs) -> Result<()> {
    let config = load_config(&args.config.config)?;
    let store = AnyStore::open(&config.store).context("Failed to open checkpoint store")?;
    let checkpoints = store.list().await.context("Failed to list checkpoints")?;

    println!(
        "{:<32} {:<24} {:>10}  UPDATED",
        "TABLE", "LAST LSN", "ROWS"
    );
    for table in config.table_ids()? {
        match checkpoints.iter().find(|c| c.table == table) {
            Some(checkpoint) => println!(
                "{:<32} {:<24} {:>10}  {}{}",
                table.as_str(),
                checkpoint.last_lsn.to_string(),
                checkpoint.row_count,
                checkpoint.updated_at.to_rfc3339(),
                if checkpoint.reload_requested {
                    " (full reload pending)"
                } else {
                    ""
                }
            ),
            None => println!("{:<32} {:<24} {:>10}  never synced", table.as_str(), "unset", "-"),
        }
    }

    let orphaned: Vec<_> = checkpoints
        .iter()
        .filter(|c| !config.tables.iter().any(|t| t.name == c.table.as_str()))
        .collect();
    if !orphaned.is_empty() {
        tracing::warn!(
            "{} checkpoints belong to tables no longer configured",
            orphaned.len()
        );
    }
    Ok(())
}
