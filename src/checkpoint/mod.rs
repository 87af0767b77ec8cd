// ABOUTME: Checkpoint store contract - per-table last applied LSN plus the mirror it describes
// ABOUTME: Commits mirror state and checkpoint advance as one atomic unit

pub mod fs;
pub mod memory;
pub mod sqlite;

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::change::TableId;
use crate::config::{StoreConfig, StoreKind};
use crate::error::{SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::mirror::RowSet;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Persisted progress of one mirrored table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub table: TableId,
    /// Every change below this LSN is reflected in the mirror.
    pub last_lsn: Lsn,
    /// Number of rows in the mirror as of this checkpoint.
    pub row_count: u64,
    pub updated_at: DateTime<Utc>,
    /// Set when the change log can no longer continue from `last_lsn`; the next
    /// cycle reloads the full snapshot. Every commit clears it.
    #[serde(default)]
    pub reload_requested: bool,
}

/// Durable writer for a table's mirror rows.
///
/// Only reachable inside [`CheckpointStore::commit`]; whatever it writes becomes
/// visible together with the checkpoint advance or not at all.
pub trait MirrorWriter {
    /// Replace the whole mirror content with `rows`.
    fn replace_rows(&mut self, rows: &RowSet) -> SyncResult<()>;
}

/// Storage for checkpoints and the mirrors they describe.
///
/// Implementations must guarantee that a reader never observes a checkpoint
/// that is ahead of (or behind) the mirror content committed with it.
pub trait CheckpointStore: Send + Sync {
    /// Full checkpoint record for a table, `None` if the table was never committed.
    fn checkpoint(
        &self,
        table: &TableId,
    ) -> impl Future<Output = SyncResult<Option<Checkpoint>>> + Send;

    /// Last applied LSN, `Lsn::Unset` for a table without a checkpoint.
    fn get(&self, table: &TableId) -> impl Future<Output = SyncResult<Lsn>> + Send {
        async move {
            Ok(self
                .checkpoint(table)
                .await?
                .map(|checkpoint| checkpoint.last_lsn)
                .unwrap_or_default())
        }
    }

    /// Mirror content as of the last commit, `None` if the mirror's storage is absent.
    fn load_mirror(
        &self,
        table: &TableId,
    ) -> impl Future<Output = SyncResult<Option<RowSet>>> + Send;

    /// Run `apply` against a transactional mirror writer and advance the
    /// checkpoint to `new_lsn`, atomically.
    ///
    /// If `apply` does not write, the mirror keeps its previous content (an
    /// absent mirror is created empty). A `new_lsn` lower than the stored
    /// checkpoint is rejected with [`SyncError::CommitConflict`].
    fn commit<F>(
        &self,
        table: &TableId,
        new_lsn: Lsn,
        apply: F,
    ) -> impl Future<Output = SyncResult<Checkpoint>> + Send
    where
        F: FnOnce(&mut dyn MirrorWriter) -> SyncResult<()> + Send;

    /// Durably mark a table for a full reload without touching its LSN or
    /// mirror. Returns whether the table had a checkpoint to mark.
    fn request_full_reload(
        &self,
        table: &TableId,
    ) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Delete the checkpoint and mirror of a table, forcing a full reload.
    /// Returns whether anything was stored.
    fn reset(&self, table: &TableId) -> impl Future<Output = SyncResult<bool>> + Send;

    /// All checkpoints, ordered by table.
    fn list(&self) -> impl Future<Output = SyncResult<Vec<Checkpoint>>> + Send;
}

/// Writer that keeps the replacement rows in memory until the store publishes them.
#[derive(Default)]
pub(crate) struct StagingWriter {
    pub(crate) staged: Option<RowSet>,
}

impl MirrorWriter for StagingWriter {
    fn replace_rows(&mut self, rows: &RowSet) -> SyncResult<()> {
        self.staged = Some(rows.clone());
        Ok(())
    }
}

pub(crate) fn check_monotonic(
    table: &TableId,
    previous: Option<&Lsn>,
    new_lsn: &Lsn,
) -> SyncResult<()> {
    match previous {
        Some(previous) if new_lsn < previous => Err(SyncError::CommitConflict {
            table: table.clone(),
            detail: format!("checkpoint would move backwards from {previous} to {new_lsn}"),
        }),
        _ => Ok(()),
    }
}

/// Named points inside a commit where a failure can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// The next store operation fails as if the backing store were unreachable.
    Unavailable,
    /// The commit fails before the mirror writer runs.
    BeforeApply,
    /// The mirror has been written but the checkpoint has not advanced yet.
    AfterMirrorWrite,
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultPoint::Unavailable => "unavailable",
            FaultPoint::BeforeApply => "before_apply",
            FaultPoint::AfterMirrorWrite => "after_mirror_write",
        };
        f.write_str(name)
    }
}

/// One-shot failures armed at [`FaultPoint`]s.
#[derive(Debug, Default)]
pub struct FaultInjector {
    armed: Mutex<HashSet<FaultPoint>>,
}

impl FaultInjector {
    pub fn arm(&self, point: FaultPoint) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(point);
        }
    }

    pub fn disarm_all(&self) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.clear();
        }
    }

    /// Fail once if `point` is armed.
    pub(crate) fn trip(&self, point: FaultPoint) -> SyncResult<()> {
        let fired = self
            .armed
            .lock()
            .map(|mut armed| armed.remove(&point))
            .unwrap_or(false);
        if fired {
            tracing::warn!("Injected store fault at {}", point);
            return Err(SyncError::StoreUnavailable(format!(
                "injected fault at {point}"
            )));
        }
        Ok(())
    }
}

/// Store selected at runtime from configuration.
pub enum AnyStore {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
    Fs(FsStore),
}

impl AnyStore {
    pub fn open(config: &StoreConfig) -> SyncResult<Self> {
        let store = match config.kind {
            StoreKind::Memory => AnyStore::Memory(MemoryStore::new()),
            StoreKind::Sqlite => AnyStore::Sqlite(SqliteStore::open(&config.path)?),
            StoreKind::Fs => AnyStore::Fs(FsStore::open(&config.path)?),
        };
        tracing::debug!("Opened {:?} checkpoint store at {:?}", config.kind, config.path);
        Ok(store)
    }

    pub fn faults(&self) -> &FaultInjector {
        match self {
            AnyStore::Memory(store) => store.faults(),
            AnyStore::Sqlite(store) => store.faults(),
            AnyStore::Fs(store) => store.faults(),
        }
    }
}

impl CheckpointStore for AnyStore {
    async fn checkpoint(&self, table: &TableId) -> SyncResult<Option<Checkpoint>> {
        match self {
            AnyStore::Memory(store) => store.checkpoint(table).await,
            AnyStore::Sqlite(store) => store.checkpoint(table).await,
            AnyStore::Fs(store) => store.checkpoint(table).await,
        }
    }

    async fn load_mirror(&self, table: &TableId) -> SyncResult<Option<RowSet>> {
        match self {
            AnyStore::Memory(store) => store.load_mirror(table).await,
            AnyStore::Sqlite(store) => store.load_mirror(table).await,
            AnyStore::Fs(store) => store.load_mirror(table).await,
        }
    }

    async fn commit<F>(&self, table: &TableId, new_lsn: Lsn, apply: F) -> SyncResult<Checkpoint>
    where
        F: FnOnce(&mut dyn MirrorWriter) -> SyncResult<()> + Send,
    {
        match self {
            AnyStore::Memory(store) => store.commit(table, new_lsn, apply).await,
            AnyStore::Sqlite(store) => store.commit(table, new_lsn, apply).await,
            AnyStore::Fs(store) => store.commit(table, new_lsn, apply).await,
        }
    }

    async fn request_full_reload(&self, table: &TableId) -> SyncResult<bool> {
        match self {
            AnyStore::Memory(store) => store.request_full_reload(table).await,
            AnyStore::Sqlite(store) => store.request_full_reload(table).await,
            AnyStore::Fs(store) => store.request_full_reload(table).await,
        }
    }

    async fn reset(&self, table: &TableId) -> SyncResult<bool> {
        match self {
            AnyStore::Memory(store) => store.reset(table).await,
            AnyStore::Sqlite(store) => store.reset(table).await,
            AnyStore::Fs(store) => store.reset(table).await,
        }
    }

    async fn list(&self) -> SyncResult<Vec<Checkpoint>> {
        match self {
            AnyStore::Memory(store) => store.list().await,
            AnyStore::Sqlite(store) => store.list().await,
            AnyStore::Fs(store) => store.list().await,
        }
    }
}
