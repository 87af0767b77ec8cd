// ABOUTME: In-memory checkpoint store for tests and dry runs
// ABOUTME: Stages mirror writes and publishes them with the checkpoint under one lock

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use super::{
    check_monotonic, Checkpoint, CheckpointStore, FaultInjector, FaultPoint, MirrorWriter,
    StagingWriter,
};
use crate::change::TableId;
use crate::error::SyncResult;
use crate::lsn::Lsn;
use crate::mirror::RowSet;

#[derive(Debug, Clone)]
struct TableEntry {
    checkpoint: Checkpoint,
    rows: RowSet,
}

/// Volatile store; clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<BTreeMap<TableId, TableEntry>>>,
    faults: Arc<FaultInjector>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

impl CheckpointStore for MemoryStore {
    async fn checkpoint(&self, table: &TableId) -> SyncResult<Option<Checkpoint>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(|entry| entry.checkpoint.clone()))
    }

    async fn load_mirror(&self, table: &TableId) -> SyncResult<Option<RowSet>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(|entry| entry.rows.clone()))
    }

    async fn commit<F>(&self, table: &TableId, new_lsn: Lsn, apply: F) -> SyncResult<Checkpoint>
    where
        F: FnOnce(&mut dyn MirrorWriter) -> SyncResult<()> + Send,
    {
        self.faults.trip(FaultPoint::Unavailable)?;
        let mut tables = self.tables.lock().await;
        let previous = tables.get(table);
        check_monotonic(table, previous.map(|e| &e.checkpoint.last_lsn), &new_lsn)?;
        self.faults.trip(FaultPoint::BeforeApply)?;

        let mut writer = StagingWriter::default();
        apply(&mut writer)?;
        let rows = match writer.staged {
            Some(rows) => rows,
            None => previous.map(|e| e.rows.clone()).unwrap_or_default(),
        };
        self.faults.trip(FaultPoint::AfterMirrorWrite)?;

        let checkpoint = Checkpoint {
            table: table.clone(),
            last_lsn: new_lsn,
            row_count: rows.len() as u64,
            updated_at: Utc::now(),
            reload_requested: false,
        };
        tables.insert(
            table.clone(),
            TableEntry {
                checkpoint: checkpoint.clone(),
                rows,
            },
        );
        Ok(checkpoint)
    }

    async fn request_full_reload(&self, table: &TableId) -> SyncResult<bool> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let mut tables = self.tables.lock().await;
        Ok(match tables.get_mut(table) {
            Some(entry) => {
                entry.checkpoint.reload_requested = true;
                true
            }
            None => false,
        })
    }

    async fn reset(&self, table: &TableId) -> SyncResult<bool> {
        self.faults.trip(FaultPoint::Unavailable)?;
        Ok(self.tables.lock().await.remove(table).is_some())
    }

    async fn list(&self) -> SyncResult<Vec<Checkpoint>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let tables = self.tables.lock().await;
        Ok(tables.values().map(|e| e.checkpoint.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Columns, RowKey};
    use crate::mirror::MirrorRow;
    use serde_json::json;

    fn table() -> TableId {
        TableId::new("Customers").unwrap()
    }

    fn rows(names: &[&str]) -> RowSet {
        RowSet::from_rows(
            &table(),
            names.iter().enumerate().map(|(i, n)| {
                let cols: Columns = json!({ "Name": n }).as_object().cloned().unwrap();
                MirrorRow::new(RowKey::single(i as i64 + 1), cols)
            }),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_commit_publishes_rows_and_checkpoint() {
        let store = MemoryStore::new();
        assert_eq!(store.get(&table()).await.unwrap(), Lsn::Unset);
        assert!(store.load_mirror(&table()).await.unwrap().is_none());

        let written = rows(&["Alice", "Bob"]);
        let checkpoint = store
            .commit(&table(), Lsn::from(10), |w| w.replace_rows(&written))
            .await
            .unwrap();
        assert_eq!(checkpoint.row_count, 2);
        assert_eq!(store.get(&table()).await.unwrap(), Lsn::from(10));
        assert_eq!(store.load_mirror(&table()).await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_commit_without_write_keeps_rows() {
        let store = MemoryStore::new();
        let written = rows(&["Alice"]);
        store
            .commit(&table(), Lsn::from(10), |w| w.replace_rows(&written))
            .await
            .unwrap();
        store
            .commit(&table(), Lsn::from(12), |_| Ok(()))
            .await
            .unwrap();

        assert_eq!(store.get(&table()).await.unwrap(), Lsn::from(12));
        assert_eq!(store.load_mirror(&table()).await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_state_untouched() {
        let store = MemoryStore::new();
        let written = rows(&["Alice"]);
        store
            .commit(&table(), Lsn::from(10), |w| w.replace_rows(&written))
            .await
            .unwrap();

        store.faults().arm(FaultPoint::AfterMirrorWrite);
        let replacement = rows(&["Zed", "Yan"]);
        let err = store
            .commit(&table(), Lsn::from(20), |w| w.replace_rows(&replacement))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        assert_eq!(store.get(&table()).await.unwrap(), Lsn::from(10));
        assert_eq!(store.load_mirror(&table()).await.unwrap(), Some(written));
    }

    #[tokio::test]
    async fn test_backwards_commit_is_rejected() {
        let store = MemoryStore::new();
        store.commit(&table(), Lsn::from(10), |_| Ok(())).await.unwrap();
        let err = store
            .commit(&table(), Lsn::from(9), |_| Ok(()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CommitConflict);
    }

    #[tokio::test]
    async fn test_reset_forgets_table() {
        let store = MemoryStore::new();
        store.commit(&table(), Lsn::from(10), |_| Ok(())).await.unwrap();
        assert!(store.reset(&table()).await.unwrap());
        assert!(!store.reset(&table()).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
