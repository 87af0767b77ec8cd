// ABOUTME: TOML configuration for the mirror engine, store, source and daemon
// ABOUTME: Every section has defaults; validation rejects unusable settings before any I/O

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::change::TableId;
use crate::error::{SyncError, SyncResult};

/// Upper bound on `engine.source_retries`; the backoff doubles per retry.
const MAX_RETRIES: u32 = 20;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub daemon: DaemonConfig,
    pub store: StoreConfig,
    pub source: SourceConfig,
    pub tables: Vec<TableConfig>,
}

/// Orchestrator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Deadline for the loading phase of one cycle; 0 disables it.
    pub load_timeout_secs: u64,
    /// Retries for transient source and store reads.
    pub source_retries: u32,
    /// Delay before the first retry, doubled after each attempt.
    pub retry_delay_ms: u64,
    /// Rows per progress step while reading a snapshot.
    pub snapshot_chunk_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_timeout_secs: 600,
            source_retries: 3,
            retry_delay_ms: 500,
            snapshot_chunk_size: 10_000,
        }
    }
}

impl EngineConfig {
    pub fn load_timeout(&self) -> Option<Duration> {
        (self.load_timeout_secs > 0).then(|| Duration::from_secs(self.load_timeout_secs))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl DaemonConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Sqlite,
    Fs,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Database file for `sqlite`, root directory for `fs`, unused for `memory`.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sqlite,
            path: PathBuf::from(".cdc-mirror/state.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// CDC export directory.
    pub path: PathBuf,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cdc-export"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        let mut config = Self::parse(&text)?;
        config.resolve_paths(path.parent().unwrap_or_else(|| Path::new("")));
        Ok(config)
    }

    pub fn parse(text: &str) -> SyncResult<Self> {
        let config: Config = toml::from_str(text)
            .map_err(|e| SyncError::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.tables.is_empty() {
            return Err(SyncError::Config(
                "at least one [[tables]] entry is required".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            TableId::new(&table.name)?;
            if !seen.insert(table.name.as_str()) {
                return Err(SyncError::Config(format!(
                    "table '{}' is configured twice",
                    table.name
                )));
            }
        }
        if self.engine.snapshot_chunk_size == 0 {
            return Err(SyncError::Config(
                "engine.snapshot_chunk_size must be at least 1".to_string(),
            ));
        }
        if self.engine.source_retries > MAX_RETRIES {
            return Err(SyncError::Config(format!(
                "engine.source_retries must be at most {MAX_RETRIES}"
            )));
        }
        if self.daemon.interval_secs == 0 {
            return Err(SyncError::Config(
                "daemon.interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Relative store and source paths are taken relative to the config file.
    fn resolve_paths(&mut self, base: &Path) {
        if self.store.path.is_relative() {
            self.store.path = base.join(&self.store.path);
        }
        if self.source.path.is_relative() {
            self.source.path = base.join(&self.source.path);
        }
    }

    pub fn table_ids(&self) -> SyncResult<Vec<TableId>> {
        self.tables.iter().map(|t| TableId::new(&t.name)).collect()
    }
}
