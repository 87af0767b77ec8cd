// ABOUTME: Command implementations for the cdc-mirror CLI
// ABOUTME: Exports sync, daemon, status and reset plus shared config/engine wiring

pub mod daemon;
pub mod reset;
pub mod status;
pub mod sync;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;

use crate::change::TableId;
use crate::checkpoint::AnyStore;
use crate::config::Config;
use crate::engine::{CycleResult, CycleStatus, SyncEngine};
use crate::source::ExportSource;

/// Engine wired to the configured export directory and checkpoint store.
pub type MirrorEngine = SyncEngine<ExportSource, AnyStore>;

#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to the cdc-mirror TOML configuration
    #[arg(long, env = "CDC_MIRROR_CONFIG", default_value = "cdc-mirror.toml")]
    pub config: PathBuf,
}

pub fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

pub fn build_engine(config: &Config) -> Result<MirrorEngine> {
    let store = AnyStore::open(&config.store).context("Failed to open checkpoint store")?;
    let source = ExportSource::new(&config.source.path);
    Ok(SyncEngine::new(source, store, config.engine.clone()))
}

/// Resolve `--table` arguments against the configured tables; none means all of them.
pub fn select_tables(config: &Config, requested: &[String]) -> Result<Vec<TableId>> {
    let configured = config.table_ids()?;
    if requested.is_empty() {
        return Ok(configured);
    }
    let mut selected = Vec::with_capacity(requested.len());
    for name in requested {
        let table = TableId::new(name)?;
        if !configured.contains(&table) {
            bail!("Table '{}' is not configured in [[tables]]", name);
        }
        selected.push(table);
    }
    Ok(selected)
}

pub fn format_result(result: &CycleResult) -> String {
    let load = result
        .load
        .map(|load| format!("{load:?}").to_lowercase())
        .unwrap_or_else(|| "-".to_string());
    match &result.status {
        CycleStatus::Committed => format!(
            "{}: committed ({} load) lsn={} rows_changed={} in {}ms",
            result.table,
            load,
            result.new_lsn.unwrap_or_default(),
            result.rows_changed,
            result.duration_ms
        ),
        CycleStatus::SkippedNoChanges => format!(
            "{}: no changes since {}",
            result.table,
            result.new_lsn.unwrap_or_default()
        ),
        CycleStatus::Failed { kind, message } => {
            format!("{}: failed [{}] {}", result.table, kind, message)
        }
    }
}
