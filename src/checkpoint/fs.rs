// ABOUTME: Filesystem checkpoint store - one directory per table holding JSON files
// ABOUTME: Mirror generations are staged first; renaming checkpoint.json publishes a commit

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::RwLock;

use super::{
    check_monotonic, Checkpoint, CheckpointStore, FaultInjector, FaultPoint, MirrorWriter,
    StagingWriter,
};
use crate::change::TableId;
use crate::error::{SyncError, SyncResult};
use crate::lsn::Lsn;
use crate::mirror::{MirrorRow, RowSet};

const CHECKPOINT_FILE: &str = "checkpoint.json";
const MIRROR_PREFIX: &str = "mirror-";

/// On-disk checkpoint record; `generation` names the mirror file it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointFile {
    table: TableId,
    last_lsn: Lsn,
    row_count: u64,
    updated_at: DateTime<Utc>,
    generation: u64,
    #[serde(default)]
    reload_requested: bool,
}

impl CheckpointFile {
    fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            table: self.table.clone(),
            last_lsn: self.last_lsn,
            row_count: self.row_count,
            updated_at: self.updated_at,
            reload_requested: self.reload_requested,
        }
    }
}

/// Durable store laid out as `<root>/<table>/{checkpoint.json, mirror-<generation>.json}`.
///
/// A reader always resolves the mirror through `checkpoint.json`, so a crash
/// between staging a generation and renaming the checkpoint leaves the previous
/// commit visible. Each table has its own lock; file I/O for a commit runs on
/// the blocking pool.
pub struct FsStore {
    root: PathBuf,
    locks: Mutex<HashMap<TableId, Arc<RwLock<()>>>>,
    faults: Arc<FaultInjector>,
}

/// Owned inputs for publishing one commit off the async runtime.
struct Publish {
    dir: PathBuf,
    table: TableId,
    new_lsn: Lsn,
    previous: Option<CheckpointFile>,
    staged: Option<RowSet>,
    faults: Arc<FaultInjector>,
}

fn mirror_file_name(generation: u64) -> String {
    format!("{MIRROR_PREFIX}{generation:08}.json")
}

/// Write `bytes` to `dir/name` through a synced temp file and a rename.
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> SyncResult<()> {
    let target = dir.join(name);
    let mut file = NamedTempFile::new_in(dir)
        .map_err(|e| SyncError::store(&format!("failed to stage {}", target.display()), e))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| SyncError::store(&format!("failed to write {}", target.display()), e))?;
    file.persist(&target)
        .map_err(|e| SyncError::store(&format!("failed to publish {}", target.display()), e))?;
    sync_dir(dir);
    Ok(())
}

fn write_state(dir: &Path, state: &CheckpointFile) -> SyncResult<()> {
    let bytes = serde_json::to_vec_pretty(state)
        .map_err(|e| SyncError::store("failed to encode checkpoint", e))?;
    write_atomic(dir, CHECKPOINT_FILE, &bytes)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = std::fs::File::open(dir).and_then(|d| d.sync_all()) {
        tracing::warn!("Failed to sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn parse_state(path: &Path, bytes: &[u8]) -> SyncResult<CheckpointFile> {
    serde_json::from_slice(bytes)
        .map_err(|e| SyncError::store(&format!("corrupt checkpoint {}", path.display()), e))
}

async fn read_state(dir: &Path) -> SyncResult<Option<CheckpointFile>> {
    let path = dir.join(CHECKPOINT_FILE);
    match tokio::fs::read(&path).await {
        Ok(bytes) => parse_state(&path, &bytes).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::store(
            &format!("failed to read {}", path.display()),
            e,
        )),
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Run blocking file work on the blocking pool.
async fn blocking<T, F>(work: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> SyncResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SyncError::store("filesystem task failed", e))?
}

/// Stage the mirror generation (if any) and rename the new checkpoint into place.
fn publish(job: Publish) -> SyncResult<CheckpointFile> {
    let Publish {
        dir,
        table,
        new_lsn,
        previous,
        staged,
        faults,
    } = job;
    std::fs::create_dir_all(&dir)
        .map_err(|e| SyncError::store(&format!("failed to create {}", dir.display()), e))?;

    let next_generation = previous.as_ref().map_or(1, |p| p.generation + 1);
    let result = stage_and_publish(
        &dir,
        &table,
        new_lsn,
        previous.as_ref(),
        staged,
        next_generation,
        &faults,
    );
    match result {
        Ok(state) => {
            prune_generations(&dir, state.generation);
            Ok(state)
        }
        Err(e) => {
            if let Err(cleanup) = remove_if_present(&dir.join(mirror_file_name(next_generation))) {
                tracing::warn!("Failed to remove staged mirror for {}: {}", table, cleanup);
            }
            Err(e)
        }
    }
}

fn write_generation(dir: &Path, generation: u64, rows: &RowSet) -> SyncResult<(u64, u64)> {
    let bytes = serde_json::to_vec(&rows.to_rows())
        .map_err(|e| SyncError::store("failed to encode mirror rows", e))?;
    write_atomic(dir, &mirror_file_name(generation), &bytes)?;
    Ok((generation, rows.len() as u64))
}

fn stage_and_publish(
    dir: &Path,
    table: &TableId,
    new_lsn: Lsn,
    previous: Option<&CheckpointFile>,
    staged: Option<RowSet>,
    next_generation: u64,
    faults: &FaultInjector,
) -> SyncResult<CheckpointFile> {
    let (generation, row_count) = match (staged, previous) {
        (Some(rows), _) => write_generation(dir, next_generation, &rows)?,
        // Nothing written: keep pointing at the previous generation.
        (None, Some(previous)) => (previous.generation, previous.row_count),
        (None, None) => write_generation(dir, next_generation, &RowSet::new())?,
    };
    faults.trip(FaultPoint::AfterMirrorWrite)?;

    let state = CheckpointFile {
        table: table.clone(),
        last_lsn: new_lsn,
        row_count,
        updated_at: Utc::now(),
        generation,
        reload_requested: false,
    };
    write_state(dir, &state)?;
    Ok(state)
}

/// Remove mirror files not referenced by the published checkpoint.
fn prune_generations(dir: &Path, current: u64) {
    let keep = mirror_file_name(current);
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("Failed to list {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(MIRROR_PREFIX) && name != keep.as_str() {
            if let Err(e) = remove_if_present(&entry.path()) {
                tracing::warn!("Failed to remove stale mirror {}: {}", name, e);
            }
        }
    }
}

impl FsStore {
    pub fn open(root: impl AsRef<Path>) -> SyncResult<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| {
            SyncError::store(
                &format!("failed to create store directory {}", root.display()),
                e,
            )
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
            faults: Arc::new(FaultInjector::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    fn table_dir(&self, table: &TableId) -> PathBuf {
        self.root.join(table.as_str())
    }

    fn table_lock(&self, table: &TableId) -> SyncResult<Arc<RwLock<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| SyncError::StoreUnavailable("table lock registry poisoned".into()))?;
        Ok(locks.entry(table.clone()).or_default().clone())
    }
}

impl CheckpointStore for FsStore {
    async fn checkpoint(&self, table: &TableId) -> SyncResult<Option<Checkpoint>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        Ok(read_state(&self.table_dir(table))
            .await?
            .map(|state| state.to_checkpoint()))
    }

    async fn load_mirror(&self, table: &TableId) -> SyncResult<Option<RowSet>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let lock = self.table_lock(table)?;
        let _guard = lock.read().await;
        let dir = self.table_dir(table);
        let Some(state) = read_state(&dir).await? else {
            return Ok(None);
        };

        let path = dir.join(mirror_file_name(state.generation));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    "Mirror {} for {} is missing; treating the mirror as absent",
                    path.display(),
                    table
                );
                return Ok(None);
            }
            Err(e) => {
                return Err(SyncError::store(
                    &format!("failed to read {}", path.display()),
                    e,
                ))
            }
        };
        let rows: Vec<MirrorRow> = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::store(&format!("corrupt mirror {}", path.display()), e))?;
        RowSet::from_rows(table, rows).map(Some)
    }

    async fn commit<F>(&self, table: &TableId, new_lsn: Lsn, apply: F) -> SyncResult<Checkpoint>
    where
        F: FnOnce(&mut dyn MirrorWriter) -> SyncResult<()> + Send,
    {
        self.faults.trip(FaultPoint::Unavailable)?;
        let lock = self.table_lock(table)?;
        let _guard = lock.write().await;
        let dir = self.table_dir(table);

        let previous = read_state(&dir).await?;
        check_monotonic(table, previous.as_ref().map(|p| &p.last_lsn), &new_lsn)?;
        self.faults.trip(FaultPoint::BeforeApply)?;

        let mut writer = StagingWriter::default();
        apply(&mut writer)?;

        let job = Publish {
            dir,
            table: table.clone(),
            new_lsn,
            previous,
            staged: writer.staged,
            faults: Arc::clone(&self.faults),
        };
        blocking(move || publish(job))
            .await
            .map(|state| state.to_checkpoint())
    }

    async fn request_full_reload(&self, table: &TableId) -> SyncResult<bool> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let lock = self.table_lock(table)?;
        let _guard = lock.write().await;
        let dir = self.table_dir(table);
        let Some(mut state) = read_state(&dir).await? else {
            return Ok(false);
        };
        if state.reload_requested {
            return Ok(true);
        }
        state.reload_requested = true;
        blocking(move || write_state(&dir, &state)).await?;
        Ok(true)
    }

    async fn reset(&self, table: &TableId) -> SyncResult<bool> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let lock = self.table_lock(table)?;
        let _guard = lock.write().await;
        let dir = self.table_dir(table);

        // Dropping checkpoint.json first is the reset; leftovers are just orphan files.
        let checkpoint = dir.join(CHECKPOINT_FILE);
        let had_checkpoint = match tokio::fs::remove_file(&checkpoint).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                return Err(SyncError::store(
                    &format!("failed to remove {}", checkpoint.display()),
                    e,
                ))
            }
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Failed to remove {} after reset: {}", dir.display(), e);
            }
        }
        Ok(had_checkpoint)
    }

    async fn list(&self) -> SyncResult<Vec<Checkpoint>> {
        self.faults.trip(FaultPoint::Unavailable)?;
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            SyncError::store(&format!("failed to list {}", self.root.display()), e)
        })?;

        let mut checkpoints = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SyncError::store("failed to list store directory", e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(state) = read_state(&entry.path()).await? {
                checkpoints.push(state.to_checkpoint());
            }
        }
        checkpoints.sort_by(|a, b| a.table.as_str().cmp(b.table.as_str()));
        Ok(checkpoints)
    }
}
