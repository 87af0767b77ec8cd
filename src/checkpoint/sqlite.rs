// ABOUTME: SQLite-backed checkpoint store
// ABOUTME: Mirror rows and checkpoint rows are written in a single transaction per commit

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{check_monotonic, Checkpoint, CheckpointStore, FaultInjector, FaultPoint, MirrorWriter};
use crate::change::{Columns, RowKey, TableId};
use crate::error::{SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::mirror::{MirrorRow, RowSet};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    table_id    TEXT PRIMARY KEY,
    last_lsn    TEXT NOT NULL,
    row_count   INTEGER NOT NULL DEFAULT 0,
    updated_at  TIMESTAMP NOT NULL,
    reload_requested INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS mirrors (
    table_id    TEXT PRIMARY KEY,
    written_at  TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS mirror_rows (
    table_id    TEXT NOT NULL,
    row_key     TEXT NOT NULL,
    columns     TEXT NOT NULL,
    PRIMARY KEY (table_id, row_key)
);
"#;

/// Durable store in a single SQLite database file.
pub struct SqliteStore {
    path: PathBuf,
    conn: Mutex<Connection>,
    faults: Arc<FaultInjector>,
}

struct SqliteMirrorWriter<'a> {
    conn: &'a Connection,
    table: &'a TableId,
    written: bool,
}

impl MirrorWriter for SqliteMirrorWriter<'_> {
    fn replace_rows(&mut self, rows: &RowSet) -> SyncResult<()> {
        let table = self.table.as_str();
        self.conn
            .execute("DELETE FROM mirror_rows WHERE table_id = ?1", [table])
            .map_err(|e| SyncError::store("failed to clear mirror rows", e))?;

        let mut insert = self
            .conn
            .prepare_cached(
                "INSERT INTO mirror_rows(table_id, row_key, columns) VALUES (?1, ?2, ?3)",
            )
            .map_err(|e| SyncError::store("failed to prepare mirror insert", e))?;
        for (key, columns) in rows.iter() {
            let key_json = serde_json::to_string(key)
                .map_err(|e| SyncError::store("failed to encode row key", e))?;
            let columns_json = serde_json::to_string(columns)
                .map_err(|e| SyncError::store("failed to encode row columns", e))?;
            insert
                .execute(params![table, key_json, columns_json])
                .map_err(|e| SyncError::store("failed to write mirror row", e))?;
        }

        self.conn
            .execute(
                "INSERT INTO mirrors(table_id, written_at) VALUES (?1, ?2)
                 ON CONFLICT(table_id) DO UPDATE SET written_at = excluded.written_at",
                params![table, Utc::now()],
            )
            .map_err(|e| SyncError::store("failed to mark mirror", e))?;
        self.written = true;
        Ok(())
    }
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                SyncError::store(
                    &format!("failed to create store directory {}", parent.display()),
                    e,
                )
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            SyncError::store(&format!("failed to open store {}", path.display()), e)
        })?;
        conn.pragma_update(None, "journal_mode", "wal")
            .map_err(|e| SyncError::store("failed to enable WAL for checkpoint store", e))?;
        conn.pragma_update(None, "synchronous", "full").ok();
        conn.execute_batch(SCHEMA)
            .map_err(|e| SyncError::store("failed to initialize store schema", e))?;

        tracing::debug!("Opened SQLite checkpoint store at {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            conn: Mutex::new(conn),
            faults: Arc::new(FaultInjector::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    fn lock(&self) -> SyncResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::StoreUnavailable("store connection lock poisoned".into()))
    }

    fn commit_blocking<F>(&self, table: &TableId, new_lsn: Lsn, apply: F) -> SyncResult<Checkpoint>
    where
        F: FnOnce(&mut dyn MirrorWriter) -> SyncResult<()>,
    {
        self.faults.trip(FaultPoint::Unavailable)?;
        let mut conn = self.lock()?;
        // Dropping the transaction on any early return rolls everything back.
        let tx = conn
            .transaction()
            .map_err(|e| SyncError::store("failed to begin commit", e))?;

        let previous = read_checkpoint(&tx, table)?;
        check_monotonic(table, previous.as_ref().map(|c| &c.last_lsn), &new_lsn)?;
        self.faults.trip(FaultPoint::BeforeApply)?;

        let mut writer = SqliteMirrorWriter {
            conn: &tx,
            table,
            written: false,
        };
        apply(&mut writer)?;
        if !writer.written {
            tx.execute(
                "INSERT OR IGNORE INTO mirrors(table_id, written_at) VALUES (?1, ?2)",
                params![table.as_str(), Utc::now()],
            )
            .map_err(|e| SyncError::store("failed to mark mirror", e))?;
        }
        let row_count: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM mirror_rows WHERE table_id = ?1",
                [table.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| SyncError::store("failed to count mirror rows", e))?;
        self.faults.trip(FaultPoint::AfterMirrorWrite)?;

        let checkpoint = Checkpoint {
            table: table.clone(),
            last_lsn: new_lsn,
            row_count: row_count as u64,
            updated_at: Utc::now(),
            reload_requested: false,
        };
        tx.execute(
            "INSERT INTO checkpoints(table_id, last_lsn, row_count, updated_at, reload_requested)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(table_id) DO UPDATE SET
                last_lsn = excluded.last_lsn,
                row_count = excluded.row_count,
                updated_at = excluded.updated_at,
                reload_requested = 0",
            params![
                table.as_str(),
                checkpoint.last_lsn.to_string(),
                row_count,
                checkpoint.updated_at,
            ],
        )
        .map_err(|e| SyncError::store("failed to write checkpoint", e))?;
        tx.commit()
            .map_err(|e| SyncError::store("failed to commit checkpoint", e))?;

        Ok(checkpoint)
    }
}

fn read_checkpoint(conn: &Connection, table: &TableId) -> SyncResult<Option<Checkpoint>> {
    let row = conn
        .query_row(
            "SELECT last_lsn, row_count, updated_at, reload_requested
             FROM checkpoints WHERE table_id = ?1",
            [table.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, DateTime<Utc>>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|e| SyncError::store("failed to read checkpoint", e))?;

    row.map(|(lsn, row_count, updated_at, reload_requested)| {
        Ok(Checkpoint {
            table: table.clone(),
            last_lsn: decode_lsn(&lsn)?,
            row_count: row_count as u64,
            updated_at,
            reload_requested,
        })
    })
    .transpose()
}

type ListingRow = (String, String, i64, DateTime<Utc>, bool);

fn decode_listing_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ListingRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_lsn(text: &str) -> SyncResult<Lsn> {
    Lsn::parse_hex(text).map_err(|e| SyncError::store("corrupt checkpoint", e))
}

impl CheckpointStore for SqliteStore {
    async fn checkpoint(&self, table: &TableId) -> SyncResult<Option<Checkpoint>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let conn = self.lock()?;
        read_checkpoint(&conn, table)
    }

    async fn load_mirror(&self, table: &TableId) -> SyncResult<Option<RowSet>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let conn = self.lock()?;
        let present = conn
            .query_row(
                "SELECT 1 FROM mirrors WHERE table_id = ?1",
                [table.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(|e| SyncError::store("failed to look up mirror", e))?
            .is_some();
        if !present {
            return Ok(None);
        }

        let mut stmt = conn
            .prepare("SELECT row_key, columns FROM mirror_rows WHERE table_id = ?1")
            .map_err(|e| SyncError::store("failed to prepare mirror read", e))?;
        let mut rows = stmt
            .query([table.as_str()])
            .map_err(|e| SyncError::store("failed to read mirror rows", e))?;
        let mut set = RowSet::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| SyncError::store("failed to read mirror rows", e))?
        {
            let key_json: String = row
                .get(0)
                .map_err(|e| SyncError::store("failed to read row key", e))?;
            let columns_json: String = row
                .get(1)
                .map_err(|e| SyncError::store("failed to read row columns", e))?;
            let key: RowKey = serde_json::from_str(&key_json)
                .map_err(|e| SyncError::store("corrupt mirror row key", e))?;
            let columns: Columns = serde_json::from_str(&columns_json)
                .map_err(|e| SyncError::store("corrupt mirror row", e))?;
            set.insert_new(table, MirrorRow::new(key, columns))?;
        }
        Ok(Some(set))
    }

    async fn commit<F>(&self, table: &TableId, new_lsn: Lsn, apply: F) -> SyncResult<Checkpoint>
    where
        F: FnOnce(&mut dyn MirrorWriter) -> SyncResult<()> + Send,
    {
        self.commit_blocking(table, new_lsn, apply)
    }

    async fn request_full_reload(&self, table: &TableId) -> SyncResult<bool> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let conn = self.lock()?;
        let marked = conn
            .execute(
                "UPDATE checkpoints SET reload_requested = 1 WHERE table_id = ?1",
                [table.as_str()],
            )
            .map_err(|e| SyncError::store("failed to mark table for reload", e))?;
        Ok(marked > 0)
    }

    async fn reset(&self, table: &TableId) -> SyncResult<bool> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| SyncError::store("failed to begin reset", e))?;
        let mut removed = 0;
        for sql in [
            "DELETE FROM checkpoints WHERE table_id = ?1",
            "DELETE FROM mirrors WHERE table_id = ?1",
            "DELETE FROM mirror_rows WHERE table_id = ?1",
        ] {
            removed += tx
                .execute(sql, [table.as_str()])
                .map_err(|e| SyncError::store("failed to reset table", e))?;
        }
        tx.commit()
            .map_err(|e| SyncError::store("failed to commit reset", e))?;
        Ok(removed > 0)
    }

    async fn list(&self) -> SyncResult<Vec<Checkpoint>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT table_id, last_lsn, row_count, updated_at, reload_requested
                 FROM checkpoints ORDER BY table_id",
            )
            .map_err(|e| SyncError::store("failed to prepare checkpoint listing", e))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| SyncError::store("failed to list checkpoints", e))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| SyncError::store("failed to list checkpoints", e))?
        {
            let (table, lsn, row_count, updated_at, reload_requested) = decode_listing_row(row)
                .map_err(|e| SyncError::store("failed to decode checkpoint", e))?;
            out.push(Checkpoint {
                table: TableId::try_from(table)
                    .map_err(|e| SyncError::store("corrupt checkpoint table name", e))?,
                last_lsn: decode_lsn(&lsn)?,
                row_count: row_count as u64,
                updated_at,
                reload_requested,
            });
        }
        Ok(out)
    }
}
