// ABOUTME: In-memory change source with a scripted change log and retention horizon
// ABOUTME: Supports one-shot failure injection and counts reads per table

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::stream::{self, StreamExt};

use super::{ChangeSource, RowStream};
use crate::change::{ChangeBatch, ChangeRecord, TableId};
use crate::error::{SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::mirror::MirrorRow;

#[derive(Debug, Clone, Default)]
struct CapturedTable {
    snapshot: Vec<MirrorRow>,
    changes: Vec<ChangeRecord>,
    min_lsn: Lsn,
    capture_enabled: bool,
}

#[derive(Debug, Default)]
struct Inner {
    current_lsn: Lsn,
    tables: HashMap<TableId, CapturedTable>,
    next_error: Option<SyncError>,
    snapshot_reads: HashMap<TableId, usize>,
    change_reads: HashMap<TableId, usize>,
}

/// Scriptable source; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking test thread must not wedge the remaining assertions.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_current_lsn(&self, lsn: Lsn) {
        self.lock().current_lsn = lsn;
    }

    /// Register a table with capture enabled and no rows.
    pub fn add_table(&self, table: &TableId) {
        self.lock()
            .tables
            .entry(table.clone())
            .or_default()
            .capture_enabled = true;
    }

    pub fn set_snapshot(&self, table: &TableId, rows: Vec<MirrorRow>) {
        let mut inner = self.lock();
        let entry = inner.tables.entry(table.clone()).or_default();
        entry.capture_enabled = true;
        entry.snapshot = rows;
    }

    pub fn push_change(&self, table: &TableId, record: ChangeRecord) {
        let mut inner = self.lock();
        let entry = inner.tables.entry(table.clone()).or_default();
        entry.capture_enabled = true;
        entry.changes.push(record);
    }

    /// Oldest LSN still retained in the change log.
    pub fn set_min_lsn(&self, table: &TableId, lsn: Lsn) {
        self.lock().tables.entry(table.clone()).or_default().min_lsn = lsn;
    }

    pub fn disable_capture(&self, table: &TableId) {
        if let Some(entry) = self.lock().tables.get_mut(table) {
            entry.capture_enabled = false;
        }
    }

    /// Make the next source call fail with `error`.
    pub fn fail_next(&self, error: SyncError) {
        self.lock().next_error = Some(error);
    }

    pub fn snapshot_reads(&self, table: &TableId) -> usize {
        self.lock().snapshot_reads.get(table).copied().unwrap_or(0)
    }

    pub fn change_reads(&self, table: &TableId) -> usize {
        self.lock().change_reads.get(table).copied().unwrap_or(0)
    }
}

impl Inner {
    fn take_error(&mut self) -> SyncResult<()> {
        match self.next_error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn captured(&self, table: &TableId) -> SyncResult<&CapturedTable> {
        self.tables
            .get(table)
            .filter(|t| t.capture_enabled)
            .ok_or_else(|| SyncError::CaptureNotEnabled {
                table: table.clone(),
            })
    }
}

impl ChangeSource for MemorySource {
    async fn current_lsn(&self) -> SyncResult<Lsn> {
        let mut inner = self.lock();
        inner.take_error()?;
        Ok(inner.current_lsn)
    }

    async fn full_snapshot(&self, table: &TableId) -> SyncResult<RowStream> {
        let mut inner = self.lock();
        inner.take_error()?;
        let rows = inner.captured(table)?.snapshot.clone();
        *inner.snapshot_reads.entry(table.clone()).or_default() += 1;
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn changes_since(&self, table: &TableId, from: Lsn, to: Lsn) -> SyncResult<ChangeBatch> {
        let mut inner = self.lock();
        inner.take_error()?;
        let captured = inner.captured(table)?;
        if !captured.min_lsn.is_unset() && from < captured.min_lsn {
            return Err(SyncError::RangeUnavailable {
                table: table.clone(),
                from,
                horizon: captured.min_lsn,
            });
        }

        let mut records: Vec<ChangeRecord> = captured
            .changes
            .iter()
            .filter(|r| r.lsn >= from && r.lsn < to)
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.lsn, a.sequence).cmp(&(b.lsn, b.sequence)));
        *inner.change_reads.entry(table.clone()).or_default() += 1;

        Ok(ChangeBatch::new(table.clone(), from, to, records))
    }
}
