// ABOUTME: Sync orchestrator - runs load/merge/commit cycles per table
// ABOUTME: Serializes cycles per table, bounds loading by timeout and shutdown, never cancels commits

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::Instrument;
use uuid::Uuid;

use crate::change::TableId;
use crate::checkpoint::CheckpointStore;
use crate::config::EngineConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::merge::merge;
use crate::mirror::RowSet;
use crate::source::{collect_snapshot, ChangeSource};
use crate::utils::retry_with_backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadKind {
    Full,
    Incremental,
}

/// Where a table's state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Loading(LoadKind),
    Committing,
    /// The last cycle failed; the next one starts from `Idle` again.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleStatus {
    Committed,
    SkippedNoChanges,
    Failed { kind: ErrorKind, message: String },
}

/// Outcome of one cycle for one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleResult {
    pub table: TableId,
    pub status: CycleStatus,
    /// Kind of load performed, `None` if the cycle ended before loading.
    pub load: Option<LoadKind>,
    /// Rows inserted, updated or deleted; the loaded row count for a full load.
    pub rows_changed: u64,
    /// Checkpoint after the cycle, `None` when the cycle failed.
    pub new_lsn: Option<Lsn>,
    pub duration_ms: u64,
}

impl CycleResult {
    pub fn is_committed(&self) -> bool {
        self.status == CycleStatus::Committed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, CycleStatus::Failed { .. })
    }

    /// Error kind of a failed cycle.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.status {
            CycleStatus::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    fn failed(table: &TableId, load: Option<LoadKind>, error: &SyncError, start: Instant) -> Self {
        Self {
            table: table.clone(),
            status: CycleStatus::Failed {
                kind: error.kind(),
                message: error.to_string(),
            },
            load,
            rows_changed: 0,
            new_lsn: None,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Per-table coordination state.
#[derive(Debug)]
struct TableRuntime {
    cycle_lock: tokio::sync::Mutex<()>,
    phase: Mutex<CyclePhase>,
    force_full: AtomicBool,
}

impl TableRuntime {
    fn new() -> Self {
        Self {
            cycle_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(CyclePhase::Idle),
            force_full: AtomicBool::new(false),
        }
    }

    fn set_phase(&self, phase: CyclePhase) {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner()) = phase;
    }

    fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Result of the loading phase: what to commit, or nothing to do.
enum Loaded {
    NoChanges {
        checkpoint: Lsn,
    },
    Ready {
        load: LoadKind,
        new_lsn: Lsn,
        /// `None` keeps the committed mirror as it is.
        rows: Option<RowSet>,
        rows_changed: u64,
    },
}

/// Drives sync cycles for any number of tables against one source and one store.
///
/// Tables are independent; within one table cycles never overlap. A cycle that
/// finds another one in flight fails immediately with `CommitConflict`.
pub struct SyncEngine<S, C> {
    source: S,
    store: C,
    config: EngineConfig,
    tables: Mutex<HashMap<TableId, Arc<TableRuntime>>>,
}

impl<S, C> SyncEngine<S, C>
where
    S: ChangeSource,
    C: CheckpointStore,
{
    pub fn new(source: S, store: C, config: EngineConfig) -> Self {
        Self {
            source,
            store,
            config,
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn runtime(&self, table: &TableId) -> Arc<TableRuntime> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables
            .entry(table.clone())
            .or_insert_with(|| Arc::new(TableRuntime::new()))
            .clone()
    }

    pub fn phase(&self, table: &TableId) -> CyclePhase {
        self.runtime(table).phase()
    }

    /// Make the next cycle of `table` run by this engine reload the full snapshot
    /// regardless of its checkpoint.
    pub fn force_full_reload(&self, table: &TableId) {
        self.runtime(table).force_full.store(true, Ordering::SeqCst);
    }

    pub async fn run_cycle(&self, table: &TableId) -> CycleResult {
        self.run_cycle_until(table, std::future::pending::<()>())
            .await
    }

    /// Run one cycle; `shutdown` resolving while the cycle is still loading cancels it.
    pub async fn run_cycle_until<F>(&self, table: &TableId, shutdown: F) -> CycleResult
    where
        F: Future<Output = ()> + Send,
    {
        let start = Instant::now();
        let runtime = self.runtime(table);
        let Ok(_guard) = runtime.cycle_lock.try_lock() else {
            let error = SyncError::CommitConflict {
                table: table.clone(),
                detail: "another cycle for this table is in flight".to_string(),
            };
            tracing::warn!("{}", error);
            return CycleResult::failed(table, None, &error, start);
        };

        let cycle_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_cycle", table = %table, cycle_id = %cycle_id);
        self.cycle(table, &runtime, shutdown, start)
            .instrument(span)
            .await
    }

    /// Run one cycle for every table concurrently.
    pub async fn run_all(&self, tables: &[TableId]) -> Vec<CycleResult> {
        futures::future::join_all(tables.iter().map(|table| self.run_cycle(table))).await
    }

    async fn cycle<F>(
        &self,
        table: &TableId,
        runtime: &TableRuntime,
        shutdown: F,
        start: Instant,
    ) -> CycleResult
    where
        F: Future<Output = ()> + Send,
    {
        tracing::debug!("Starting sync cycle");
        let expected = if runtime.force_full.load(Ordering::SeqCst) {
            LoadKind::Full
        } else {
            LoadKind::Incremental
        };
        runtime.set_phase(CyclePhase::Loading(expected));
        let loaded = tokio::select! {
            biased;
            _ = shutdown => Err(SyncError::Cancelled {
                table: table.clone(),
                reason: "shutdown requested".to_string(),
            }),
            loaded = self.load_with_deadline(table, runtime) => loaded,
        };

        let (load, new_lsn, rows, rows_changed) = match loaded {
            Ok(Loaded::NoChanges { checkpoint }) => {
                runtime.set_phase(CyclePhase::Idle);
                tracing::debug!("No changes since {}", checkpoint);
                return CycleResult {
                    table: table.clone(),
                    status: CycleStatus::SkippedNoChanges,
                    load: Some(LoadKind::Incremental),
                    rows_changed: 0,
                    new_lsn: Some(checkpoint),
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
            Ok(Loaded::Ready {
                load,
                new_lsn,
                rows,
                rows_changed,
            }) => (load, new_lsn, rows, rows_changed),
            Err(error) => return self.fail(table, runtime, phase_load(runtime), error, start),
        };

        // From here on the cycle runs to completion or failure.
        runtime.set_phase(CyclePhase::Committing);
        let rows = rows.as_ref();
        let committed = retry_with_backoff(
            || {
                self.store.commit(table, new_lsn, move |writer| match rows {
                    Some(rows) => writer.replace_rows(rows),
                    None => Ok(()),
                })
            },
            self.config.source_retries,
            self.config.retry_delay(),
        )
        .await;

        match committed {
            Ok(checkpoint) => {
                if load == LoadKind::Full {
                    runtime.force_full.store(false, Ordering::SeqCst);
                }
                runtime.set_phase(CyclePhase::Idle);
                tracing::info!(
                    "Committed {:?} load of {} at {}: {} rows changed, {} rows in mirror",
                    load,
                    table,
                    checkpoint.last_lsn,
                    rows_changed,
                    checkpoint.row_count
                );
                CycleResult {
                    table: table.clone(),
                    status: CycleStatus::Committed,
                    load: Some(load),
                    rows_changed,
                    new_lsn: Some(checkpoint.last_lsn),
                    duration_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(error) => self.fail(table, runtime, Some(load), error, start),
        }
    }

    fn fail(
        &self,
        table: &TableId,
        runtime: &TableRuntime,
        load: Option<LoadKind>,
        error: SyncError,
        start: Instant,
    ) -> CycleResult {
        runtime.set_phase(CyclePhase::Failed);
        if error.kind().is_fatal() {
            tracing::error!("Sync cycle for {} failed: {}", table, error);
        } else {
            tracing::warn!("Sync cycle for {} failed: {}", table, error);
        }
        CycleResult::failed(table, load, &error, start)
    }

    async fn load_with_deadline(
        &self,
        table: &TableId,
        runtime: &TableRuntime,
    ) -> SyncResult<Loaded> {
        match self.config.load_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, self.load(table, runtime))
                .await
                .map_err(|_| SyncError::Cancelled {
                    table: table.clone(),
                    reason: format!("loading exceeded {deadline:?}"),
                })?,
            None => self.load(table, runtime).await,
        }
    }

    async fn load(&self, table: &TableId, runtime: &TableRuntime) -> SyncResult<Loaded> {
        let retries = self.config.source_retries;
        let delay = self.config.retry_delay();

        let record = retry_with_backoff(|| self.store.checkpoint(table), retries, delay).await?;
        let checkpoint = record.as_ref().map(|c| c.last_lsn).unwrap_or_default();
        let marked = record.as_ref().is_some_and(|c| c.reload_requested);
        if marked || runtime.force_full.load(Ordering::SeqCst) {
            tracing::info!("Forced full reload of {}", table);
            return self.load_full(table, runtime, checkpoint).await;
        }

        let mirror = if checkpoint.is_unset() {
            None
        } else {
            retry_with_backoff(|| self.store.load_mirror(table), retries, delay).await?
        };
        let Some(mirror) = mirror else {
            if !checkpoint.is_unset() {
                tracing::warn!(
                    "Mirror of {} is missing at checkpoint {}; reloading",
                    table,
                    checkpoint
                );
            }
            return self.load_full(table, runtime, checkpoint).await;
        };

        runtime.set_phase(CyclePhase::Loading(LoadKind::Incremental));
        let current = retry_with_backoff(|| self.source.current_lsn(), retries, delay).await?;
        if current < checkpoint {
            return Err(SyncError::SourceRegressed {
                table: table.clone(),
                checkpoint,
                current,
            });
        }
        if current == checkpoint {
            return Ok(Loaded::NoChanges { checkpoint });
        }

        let batch = match retry_with_backoff(
            || self.source.changes_since(table, checkpoint, current),
            retries,
            delay,
        )
        .await
        {
            Ok(batch) => batch,
            Err(error) => {
                if error.kind() == ErrorKind::RangeUnavailable {
                    runtime.force_full.store(true, Ordering::SeqCst);
                    self.mark_for_reload(table).await;
                    tracing::warn!("{}; next cycle performs a full reload", error);
                }
                return Err(error);
            }
        };
        tracing::debug!("Merging {} changes into {} rows", batch.len(), mirror.len());

        let outcome = merge(mirror, &batch)?;
        let rows_changed = outcome.stats.rows_changed();
        Ok(Loaded::Ready {
            load: LoadKind::Incremental,
            new_lsn: current,
            rows: (rows_changed > 0).then_some(outcome.rows),
            rows_changed,
        })
    }

    /// Persist the reload request so it outlives this engine.
    async fn mark_for_reload(&self, table: &TableId) {
        let marked = retry_with_backoff(
            || self.store.request_full_reload(table),
            self.config.source_retries,
            self.config.retry_delay(),
        )
        .await;
        if let Err(e) = marked {
            tracing::warn!("Failed to record pending full reload of {}: {}", table, e);
        }
    }

    async fn load_full(
        &self,
        table: &TableId,
        runtime: &TableRuntime,
        checkpoint: Lsn,
    ) -> SyncResult<Loaded> {
        let retries = self.config.source_retries;
        let delay = self.config.retry_delay();
        runtime.set_phase(CyclePhase::Loading(LoadKind::Full));

        // Captured before reading so changes landing during the read are replayed next cycle.
        let snapshot_lsn = retry_with_backoff(|| self.source.current_lsn(), retries, delay).await?;
        if snapshot_lsn < checkpoint {
            return Err(SyncError::SourceRegressed {
                table: table.clone(),
                checkpoint,
                current: snapshot_lsn,
            });
        }
        tracing::info!("Full load of {} at {}", table, snapshot_lsn);

        let stream = retry_with_backoff(|| self.source.full_snapshot(table), retries, delay).await?;
        let rows = collect_snapshot(table, stream, self.config.snapshot_chunk_size).await?;
        Ok(Loaded::Ready {
            load: LoadKind::Full,
            new_lsn: snapshot_lsn,
            rows_changed: rows.len() as u64,
            rows: Some(rows),
        })
    }
}

fn phase_load(runtime: &TableRuntime) -> Option<LoadKind> {
    match runtime.phase() {
        CyclePhase::Loading(load) => Some(load),
        _ => None,
    }
}
