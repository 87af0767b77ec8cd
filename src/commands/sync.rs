// ABOUTME: One-shot sync command - runs a single cycle per selected table
// ABOUTME: Prints one line per table and fails if any cycle failed

use anyhow::{bail, Result};
use clap::Args;

use super::{build_engine, format_result, load_config, select_tables, ConfigArgs};

#[derive(Args, Debug)]
pub struct SyncArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
    /// Only sync these tables (repeatable); defaults to every configured table
    #[arg(long = "table")]
    pub tables: Vec<String>,
}

pub async fn command(args: SyncArgs) -> Result<()> {
    let config = load_config(&args.config.config)?;
    let tables = select_tables(&config, &args.tables)?;
    let engine = build_engine(&config)?;

    tracing::info!("Running sync cycle for {} tables", tables.len());
    let results = engine.run_all(&tables).await;
    for result in &results {
        println!("{}", format_result(result));
    }

    let failed = results.iter().filter(|r| r.is_failed()).count();
    if failed > 0 {
        bail!("{} of {} tables failed to sync", failed, results.len());
    }
    Ok(())
}
