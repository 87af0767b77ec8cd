// ABOUTME: Error taxonomy for sync cycles, stores, and source adapters
// ABOUTME: Classifies failures as transient, forcing a reload, or fatal for a table

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::change::TableId;
use crate::lsn::Lsn;

/// Result type used throughout the engine.
pub type SyncResult<T> = Result<T, SyncError>;

/// Copyable classification of a [`SyncError`], reported per table in cycle results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    CaptureNotEnabled,
    RangeUnavailable,
    StoreUnavailable,
    CommitConflict,
    MergeInvariantViolation,
    SourceRegressed,
    Cancelled,
    Config,
}

impl ErrorKind {
    /// Transient failures leave all state unchanged and are retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::SourceUnavailable | ErrorKind::StoreUnavailable | ErrorKind::Cancelled
        )
    }

    /// Fatal failures keep failing for the table until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::CaptureNotEnabled
                | ErrorKind::MergeInvariantViolation
                | ErrorKind::SourceRegressed
                | ErrorKind::Config
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::CaptureNotEnabled => "capture_not_enabled",
            ErrorKind::RangeUnavailable => "range_unavailable",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::CommitConflict => "commit_conflict",
            ErrorKind::MergeInvariantViolation => "merge_invariant_violation",
            ErrorKind::SourceRegressed => "source_regressed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connectivity to the change source was lost.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("change capture is not enabled for table {table}")]
    CaptureNotEnabled { table: TableId },

    /// The requested range starts before the source's retention horizon.
    #[error("changes for {table} from {from} are no longer retained (oldest available: {horizon})")]
    RangeUnavailable {
        table: TableId,
        from: Lsn,
        horizon: Lsn,
    },

    #[error("checkpoint store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("commit conflict on {table}: {detail}")]
    CommitConflict { table: TableId, detail: String },

    #[error("merge invariant violated for {table}: {detail}")]
    MergeInvariantViolation { table: TableId, detail: String },

    #[error("source position for {table} regressed from {checkpoint} to {current}")]
    SourceRegressed {
        table: TableId,
        checkpoint: Lsn,
        current: Lsn,
    },

    #[error("cycle for {table} cancelled: {reason}")]
    Cancelled { table: TableId, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SourceUnavailable(_) => ErrorKind::SourceUnavailable,
            SyncError::CaptureNotEnabled { .. } => ErrorKind::CaptureNotEnabled,
            SyncError::RangeUnavailable { .. } => ErrorKind::RangeUnavailable,
            SyncError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            SyncError::CommitConflict { .. } => ErrorKind::CommitConflict,
            SyncError::MergeInvariantViolation { .. } => ErrorKind::MergeInvariantViolation,
            SyncError::SourceRegressed { .. } => ErrorKind::SourceRegressed,
            SyncError::Cancelled { .. } => ErrorKind::Cancelled,
            SyncError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind().is_transient()
    }

    pub(crate) fn store(context: &str, err: impl fmt::Display) -> Self {
        SyncError::StoreUnavailable(format!("{context}: {err}"))
    }

    pub(crate) fn source(context: &str, err: impl fmt::Display) -> Self {
        SyncError::SourceUnavailable(format!("{context}: {err}"))
    }

    pub(crate) fn invariant(table: &TableId, detail: impl Into<String>) -> Self {
        SyncError::MergeInvariantViolation {
            table: table.clone(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let table = TableId::new("Customers").unwrap();
        assert!(SyncError::SourceUnavailable("reset".into()).is_transient());
        assert!(SyncError::StoreUnavailable("locked".into()).is_transient());

        let range = SyncError::RangeUnavailable {
            table: table.clone(),
            from: Lsn::from(1),
            horizon: Lsn::from(5),
        };
        assert_eq!(range.kind(), ErrorKind::RangeUnavailable);
        assert!(!range.kind().is_transient());
        assert!(!range.kind().is_fatal());

        let capture = SyncError::CaptureNotEnabled { table };
        assert!(capture.kind().is_fatal());
    }

    #[test]
    fn test_error_messages_name_the_table() {
        let table = TableId::new("Orders").unwrap();
        let err = SyncError::CommitConflict {
            table,
            detail: "cycle already in flight".into(),
        };
        assert_eq!(
            err.to_string(),
            "commit conflict on Orders: cycle already in flight"
        );
        assert_eq!(err.kind().to_string(), "commit_conflict");
    }
}
