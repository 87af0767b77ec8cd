// ABOUTME: Reset command - drops a table's checkpoint and mirror
// ABOUTME: The next sync of that table performs a full reload

use anyhow::{Context, Result};
use clap::Args;

use super::{load_config, select_tables, ConfigArgs};
use crate::checkpoint::{AnyStore, CheckpointStore};

#[derive(Args, Debug)]
pub struct ResetArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Table to re-initialize
    #[arg(long)]
    pub table: String,
}

pub async fn command(args: ResetArgs) -> Result<()> {
    let config = load_config(&args.config.config)?;
    let tables = select_tables(&config, std::slice::from_ref(&args.table))?;
    let store = AnyStore::open(&config.store).context("Failed to open checkpoint store")?;

    for table in &tables {
        let removed = store
            .reset(table)
            .await
            .with_context(|| format!("Failed to reset {}", table))?;
        if removed {
            tracing::info!("Reset checkpoint and mirror of {}", table);
            println!("{}: reset, next sync performs a full load", table);
        } else {
            println!("{}: nothing to reset", table);
        }
    }
    Ok(())
}
