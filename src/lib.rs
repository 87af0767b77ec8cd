// ABOUTME: Library root for cdc-mirror - incremental CDC mirroring with LSN checkpoints
// ABOUTME: Exposes the merge engine, checkpoint stores, change sources and orchestrator

pub mod change;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod lsn;
pub mod merge;
pub mod mirror;
pub mod source;
pub mod utils;

pub use change::{ChangeBatch, ChangeRecord, Columns, KeyValue, Operation, RowKey, TableId};
pub use checkpoint::{AnyStore, Checkpoint, CheckpointStore, MirrorWriter};
pub use config::Config;
pub use engine::{CyclePhase, CycleResult, CycleStatus, LoadKind, SyncEngine};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use lsn::Lsn;
pub use mirror::{MirrorRow, RowSet};
pub use source::ChangeSource;
