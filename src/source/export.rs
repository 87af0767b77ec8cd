// ABOUTME: Change source reading a CDC export directory (max LSN, capture metadata, snapshot, change rows)
// ABOUTME: Orders change rows by start LSN, seqval and operation code before handing them to the merge

use std::io;
use std::path::{Path, PathBuf};

use futures::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use super::{strip_metadata, ChangeSource, RowStream};
use crate::change::{ChangeBatch, ChangeRecord, Columns, Operation, RowKey, TableId};
use crate::error::{SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::mirror::MirrorRow;

const CURRENT_LSN_FILE: &str = "current_lsn";
const CAPTURE_FILE: &str = "capture.json";
const SNAPSHOT_FILE: &str = "snapshot.jsonl";
const CHANGES_FILE: &str = "changes.jsonl";

const START_LSN_COLUMN: &str = "__$start_lsn";
const SEQVAL_COLUMN: &str = "__$seqval";
const OPERATION_COLUMN: &str = "__$operation";

/// Capture instance metadata for one table.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureInfo {
    pub capture_instance: String,
    pub primary_key: Vec<String>,
    /// Retention horizon; changes below it have been cleaned up.
    #[serde(default)]
    pub min_lsn: Lsn,
}

/// Source backed by an export directory:
///
/// ```text
/// <root>/current_lsn          max LSN of the source
/// <root>/<table>/capture.json
/// <root>/<table>/snapshot.jsonl
/// <root>/<table>/changes.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct ExportSource {
    root: PathBuf,
}

/// A change row before sequence numbers are assigned.
struct RawChange {
    lsn: Lsn,
    seqval: Lsn,
    operation: Operation,
    key: RowKey,
    payload: Columns,
}

impl ExportSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_dir(&self, table: &TableId) -> PathBuf {
        self.root.join(table.as_str())
    }

    async fn ensure_reachable(&self) -> SyncResult<()> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(SyncError::SourceUnavailable(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(SyncError::source(
                &format!("cannot reach export {}", self.root.display()),
                e,
            )),
        }
    }

    /// Capture metadata for a table; a table without it has no change log.
    pub async fn capture_info(&self, table: &TableId) -> SyncResult<CaptureInfo> {
        self.ensure_reachable().await?;
        let path = self.table_dir(table).join(CAPTURE_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SyncError::CaptureNotEnabled {
                    table: table.clone(),
                })
            }
            Err(e) => {
                return Err(SyncError::source(
                    &format!("failed to read {}", path.display()),
                    e,
                ))
            }
        };
        let info: CaptureInfo = serde_json::from_slice(&bytes).map_err(|e| {
            SyncError::Config(format!("invalid capture metadata {}: {}", path.display(), e))
        })?;
        if info.primary_key.is_empty() {
            return Err(SyncError::Config(format!(
                "capture instance {} for {} has no primary key columns",
                info.capture_instance, table
            )));
        }
        Ok(info)
    }

    async fn open_lines(&self, path: &Path) -> SyncResult<Option<Lines<BufReader<File>>>> {
        match File::open(path).await {
            Ok(file) => Ok(Some(BufReader::new(file).lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::source(
                &format!("failed to open {}", path.display()),
                e,
            )),
        }
    }
}

/// Streaming reader over `snapshot.jsonl`.
struct SnapshotReader {
    table: TableId,
    primary_key: Vec<String>,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

impl SnapshotReader {
    async fn next_row(&mut self) -> SyncResult<Option<MirrorRow>> {
        loop {
            let Some(line) = self
                .lines
                .next_line()
                .await
                .map_err(|e| SyncError::source("failed to read snapshot", e))?
            else {
                return Ok(None);
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let mut row = parse_object(&self.table, SNAPSHOT_FILE, self.line_no, &line)?;
            strip_metadata(&mut row);
            return MirrorRow::from_source_row(&self.table, &self.primary_key, row).map(Some);
        }
    }
}

fn parse_object(table: &TableId, file: &str, line_no: usize, line: &str) -> SyncResult<Columns> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(SyncError::invariant(
            table,
            format!("{file} line {line_no}: expected a JSON object, got {other}"),
        )),
        Err(e) => Err(SyncError::invariant(
            table,
            format!("{file} line {line_no}: {e}"),
        )),
    }
}

fn lsn_column(table: &TableId, line_no: usize, row: &Columns, column: &str) -> SyncResult<Lsn> {
    let text = row.get(column).and_then(Value::as_str).ok_or_else(|| {
        SyncError::invariant(
            table,
            format!("{CHANGES_FILE} line {line_no}: missing {column}"),
        )
    })?;
    Lsn::parse_hex(text).map_err(|e| {
        SyncError::invariant(table, format!("{CHANGES_FILE} line {line_no}: {column}: {e}"))
    })
}

/// Smallest LSN greater than `lsn`, the counterpart of `sys.fn_cdc_increment_lsn`.
/// An empty log (`Unset`) stays unset; `None` when every byte is already 0xFF.
fn increment_lsn(lsn: Lsn) -> Option<Lsn> {
    let Some(bytes) = lsn.as_bytes() else {
        return Some(Lsn::Unset);
    };
    let mut next = *bytes;
    for byte in next.iter_mut().rev() {
        let (value, carried) = byte.overflowing_add(1);
        *byte = value;
        if !carried {
            return Some(Lsn::At(next));
        }
    }
    None
}

fn parse_change(
    table: &TableId,
    primary_key: &[String],
    line_no: usize,
    line: &str,
) -> SyncResult<RawChange> {
    let mut row = parse_object(table, CHANGES_FILE, line_no, line)?;
    let lsn = lsn_column(table, line_no, &row, START_LSN_COLUMN)?;
    let seqval = lsn_column(table, line_no, &row, SEQVAL_COLUMN)?;
    let operation = row
        .get(OPERATION_COLUMN)
        .and_then(Value::as_i64)
        .and_then(Operation::from_code)
        .ok_or_else(|| {
            SyncError::invariant(
                table,
                format!("{CHANGES_FILE} line {line_no}: invalid {OPERATION_COLUMN}"),
            )
        })?;

    strip_metadata(&mut row);
    let key = RowKey::extract(primary_key, &mut row).map_err(|detail| {
        SyncError::invariant(table, format!("{CHANGES_FILE} line {line_no}: {detail}"))
    })?;
    Ok(RawChange {
        lsn,
        seqval,
        operation,
        key,
        payload: row,
    })
}

impl ChangeSource for ExportSource {
    /// The position just past the export's max LSN, so the last committed
    /// change falls inside `[checkpoint, current_lsn)`.
    async fn current_lsn(&self) -> SyncResult<Lsn> {
        self.ensure_reachable().await?;
        let path = self.root.join(CURRENT_LSN_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SyncError::source(&format!("failed to read {}", path.display()), e))?;
        let max_lsn = Lsn::parse_hex(text.trim())
            .map_err(|e| SyncError::source(&format!("invalid LSN in {}", path.display()), e))?;
        increment_lsn(max_lsn).ok_or_else(|| {
            SyncError::Config(format!(
                "max LSN {} in {} has no successor",
                max_lsn,
                path.display()
            ))
        })
    }

    async fn full_snapshot(&self, table: &TableId) -> SyncResult<RowStream> {
        let info = self.capture_info(table).await?;
        let path = self.table_dir(table).join(SNAPSHOT_FILE);
        let Some(lines) = self.open_lines(&path).await? else {
            return Err(SyncError::SourceUnavailable(format!(
                "snapshot {} is missing",
                path.display()
            )));
        };
        tracing::debug!(
            "Streaming snapshot of {} from capture instance {}",
            table,
            info.capture_instance
        );

        let reader = SnapshotReader {
            table: table.clone(),
            primary_key: info.primary_key,
            lines,
            line_no: 0,
        };
        let rows = stream::try_unfold(reader, |mut reader| async move {
            let row = reader.next_row().await?;
            Ok::<_, SyncError>(row.map(|row| (row, reader)))
        });
        Ok(rows.boxed())
    }

    async fn changes_since(&self, table: &TableId, from: Lsn, to: Lsn) -> SyncResult<ChangeBatch> {
        let info = self.capture_info(table).await?;
        if !info.min_lsn.is_unset() && from < info.min_lsn {
            return Err(SyncError::RangeUnavailable {
                table: table.clone(),
                from,
                horizon: info.min_lsn,
            });
        }

        let path = self.table_dir(table).join(CHANGES_FILE);
        let mut raw = Vec::new();
        if let Some(mut lines) = self.open_lines(&path).await? {
            let mut line_no = 0;
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| SyncError::source("failed to read change log", e))?
            {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }
                let change = parse_change(table, &info.primary_key, line_no, &line)?;
                if change.lsn >= from && change.lsn < to {
                    raw.push(change);
                }
            }
        }

        raw.sort_by(|a, b| {
            (a.lsn, a.seqval, a.operation.code()).cmp(&(b.lsn, b.seqval, b.operation.code()))
        });
        let records: Vec<ChangeRecord> = raw
            .into_iter()
            .enumerate()
            .map(|(sequence, change)| {
                let sequence = sequence as u64;
                match change.operation {
                    Operation::Delete => ChangeRecord::delete(change.key, change.lsn, sequence),
                    Operation::Insert => {
                        ChangeRecord::insert(change.key, change.payload, change.lsn, sequence)
                    }
                    Operation::UpdateBefore => {
                        ChangeRecord::update_before(change.key, change.payload, change.lsn, sequence)
                    }
                    Operation::UpdateAfter => {
                        ChangeRecord::update_after(change.key, change.payload, change.lsn, sequence)
                    }
                }
            })
            .collect();

        tracing::debug!(
            "Read {} changes for {} in [{}, {})",
            records.len(),
            table,
            from,
            to
        );
        Ok(ChangeBatch::new(table.clone(), from, to, records))
    }
}
