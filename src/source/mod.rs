// ABOUTME: Change source contract - current LSN, full snapshots and change ranges per table
// ABOUTME: Includes the chunked snapshot collector used by full loads

pub mod export;
pub mod memory;

use std::future::Future;

use futures::stream::BoxStream;
use futures::TryStreamExt;

use crate::change::{ChangeBatch, Columns, TableId};
use crate::error::SyncResult;
use crate::lsn::Lsn;
use crate::mirror::{MirrorRow, RowSet};

pub use export::ExportSource;
pub use memory::MemorySource;

/// Lazy, finite stream of a table's rows.
pub type RowStream = BoxStream<'static, SyncResult<MirrorRow>>;

/// Columns with this prefix carry capture metadata, never row data.
pub const METADATA_PREFIX: &str = "__$";

/// A database exposing row-level change capture.
pub trait ChangeSource: Send + Sync {
    /// Latest position of the source's change log at call time.
    fn current_lsn(&self) -> impl Future<Output = SyncResult<Lsn>> + Send;

    /// Entire current content of a table. Every call starts a fresh read.
    fn full_snapshot(&self, table: &TableId) -> impl Future<Output = SyncResult<RowStream>> + Send;

    /// All changes with an LSN in `[from, to)`.
    ///
    /// Fails with `RangeUnavailable` when `from` precedes the retention horizon
    /// and with `CaptureNotEnabled` when the table has no change log.
    fn changes_since(
        &self,
        table: &TableId,
        from: Lsn,
        to: Lsn,
    ) -> impl Future<Output = SyncResult<ChangeBatch>> + Send;
}

/// Drop capture metadata columns from a source row.
pub fn strip_metadata(row: &mut Columns) {
    row.retain(|name, _| !name.starts_with(METADATA_PREFIX));
}

/// Drain a snapshot stream into a row set, logging progress every `chunk_size` rows.
pub async fn collect_snapshot(
    table: &TableId,
    mut rows: RowStream,
    chunk_size: usize,
) -> SyncResult<RowSet> {
    let chunk_size = chunk_size.max(1);
    let mut set = RowSet::new();
    while let Some(row) = rows.try_next().await? {
        set.insert_new(table, row)?;
        if set.len() % chunk_size == 0 {
            tracing::debug!("Read {} snapshot rows from {}", set.len(), table);
        }
    }
    tracing::info!("Snapshot of {} complete: {} rows", table, set.len());
    Ok(set)
}
