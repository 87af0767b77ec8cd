// ABOUTME: Materialized mirror rows and the keyed row set passed through a sync cycle
// ABOUTME: Guarantees at most one row per primary key

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::{Columns, RowKey, TableId};
use crate::error::{SyncError, SyncResult};

/// A row of the mirror: its primary key plus the non-key columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRow {
    pub key: RowKey,
    pub columns: Columns,
}

impl MirrorRow {
    pub fn new(key: RowKey, columns: Columns) -> Self {
        Self { key, columns }
    }

    /// Build a row from a full source row, splitting off the primary-key columns.
    pub fn from_source_row(
        table: &TableId,
        primary_key: &[String],
        mut row: Columns,
    ) -> SyncResult<Self> {
        let key = RowKey::extract(primary_key, &mut row).map_err(|detail| {
            SyncError::invariant(table, format!("snapshot row rejected: {detail}"))
        })?;
        Ok(Self { key, columns: row })
    }
}

/// The full content of one mirror, keyed by primary key.
///
/// A `RowSet` is a plain value: the merge engine consumes one and returns the
/// next, and stores persist it as a whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    rows: BTreeMap<RowKey, Columns>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect rows, rejecting duplicate keys.
    pub fn from_rows(
        table: &TableId,
        rows: impl IntoIterator<Item = MirrorRow>,
    ) -> SyncResult<Self> {
        let mut set = RowSet::new();
        for row in rows {
            set.insert_new(table, row)?;
        }
        Ok(set)
    }

    /// Add a row whose key must not be present yet.
    pub fn insert_new(&mut self, table: &TableId, row: MirrorRow) -> SyncResult<()> {
        match self.rows.entry(row.key) {
            btree_map::Entry::Occupied(entry) => Err(SyncError::invariant(
                table,
                format!("duplicate primary key {}", entry.key()),
            )),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(row.columns);
                Ok(())
            }
        }
    }

    pub(crate) fn upsert(&mut self, key: RowKey, columns: Columns) -> Option<Columns> {
        self.rows.insert(key, columns)
    }

    pub(crate) fn remove(&mut self, key: &RowKey) -> Option<Columns> {
        self.rows.remove(key)
    }

    pub fn get(&self, key: &RowKey) -> Option<&Columns> {
        self.rows.get(key)
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in primary-key order.
    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &Columns)> {
        self.rows.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> {
        self.rows.keys()
    }

    pub fn to_rows(&self) -> Vec<MirrorRow> {
        self.rows
            .iter()
            .map(|(key, columns)| MirrorRow::new(key.clone(), columns.clone()))
            .collect()
    }
}
