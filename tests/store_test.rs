// ABOUTME: Integration tests for the durable checkpoint stores
// ABOUTME: Exercises reopen durability, crash leftovers and injected unavailability

use std::path::PathBuf;

use cdc_mirror::checkpoint::{AnyStore, FaultPoint, FsStore};
use cdc_mirror::config::{StoreConfig, StoreKind};
use cdc_mirror::{CheckpointStore, Columns, ErrorKind, KeyValue, Lsn, MirrorRow, RowKey, RowSet, TableId};
use serde_json::json;
use tempfile::tempdir;

fn order_lines() -> TableId {
    TableId::new("OrderLines").unwrap()
}

fn line(order: i64, line_no: i64, sku: &str) -> MirrorRow {
    let cols: Columns = json!({ "Sku": sku, "Qty": 1, "Note": null })
        .as_object()
        .cloned()
        .unwrap();
    MirrorRow::new(
        RowKey::new(vec![KeyValue::Int(order), KeyValue::Int(line_no)]),
        cols,
    )
}

fn sample() -> RowSet {
    RowSet::from_rows(
        &order_lines(),
        vec![line(1, 1, "A"), line(1, 2, "B"), line(2, 1, "C")],
    )
    .unwrap()
}

fn store_config(kind: StoreKind, path: PathBuf) -> StoreConfig {
    StoreConfig { kind, path }
}

async fn reopen_round_trip(kind: StoreKind, path: PathBuf) {
    let rows = sample();
    {
        let store = AnyStore::open(&store_config(kind, path.clone())).unwrap();
        let checkpoint = store
            .commit(&order_lines(), Lsn::from(500), |w| w.replace_rows(&rows))
            .await
            .unwrap();
        assert_eq!(checkpoint.row_count, 3);
    }

    let store = AnyStore::open(&store_config(kind, path)).unwrap();
    let checkpoint = store.checkpoint(&order_lines()).await.unwrap().unwrap();
    assert_eq!(checkpoint.last_lsn, Lsn::from(500));
    assert_eq!(checkpoint.row_count, 3);
    assert_eq!(store.load_mirror(&order_lines()).await.unwrap(), Some(rows));
}

#[tokio::test]
async fn test_sqlite_store_is_durable() {
    let dir = tempdir().unwrap();
    reopen_round_trip(StoreKind::Sqlite, dir.path().join("state.db")).await;
}

#[tokio::test]
async fn test_fs_store_is_durable() {
    let dir = tempdir().unwrap();
    reopen_round_trip(StoreKind::Fs, dir.path().join("state")).await;
}

#[tokio::test]
async fn test_memory_store_does_not_share_between_instances() {
    let config = store_config(StoreKind::Memory, PathBuf::new());
    let store = AnyStore::open(&config).unwrap();
    store
        .commit(&order_lines(), Lsn::from(1), |_| Ok(()))
        .await
        .unwrap();
    let fresh = AnyStore::open(&config).unwrap();
    assert_eq!(fresh.get(&order_lines()).await.unwrap(), Lsn::Unset);
}

#[tokio::test]
async fn test_unavailable_fault_fails_reads_once() {
    let dir = tempdir().unwrap();
    for kind in [StoreKind::Sqlite, StoreKind::Fs, StoreKind::Memory] {
        let store = AnyStore::open(&store_config(kind, dir.path().join(format!("{kind:?}"))))
            .unwrap();
        store.faults().arm(FaultPoint::Unavailable);

        let err = store.get(&order_lines()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(store.get(&order_lines()).await.unwrap(), Lsn::Unset);
    }
}

#[tokio::test]
async fn test_fs_store_ignores_unpublished_generation() {
    let dir = tempdir().unwrap();
    let store = FsStore::open(dir.path()).unwrap();
    let rows = sample();
    store
        .commit(&order_lines(), Lsn::from(7), |w| w.replace_rows(&rows))
        .await
        .unwrap();

    // A crash after staging the next generation but before the checkpoint rename.
    let table_dir = dir.path().join("OrderLines");
    std::fs::write(table_dir.join("mirror-00000002.json"), "[]").unwrap();

    assert_eq!(store.get(&order_lines()).await.unwrap(), Lsn::from(7));
    assert_eq!(
        store.load_mirror(&order_lines()).await.unwrap(),
        Some(rows.clone())
    );

    // The next commit overwrites the leftover and publishes normally.
    store
        .commit(&order_lines(), Lsn::from(9), |_| Ok(()))
        .await
        .unwrap();
    assert_eq!(store.load_mirror(&order_lines()).await.unwrap(), Some(rows));
    let leftovers: Vec<_> = std::fs::read_dir(&table_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with("mirror-"))
        .collect();
    assert_eq!(leftovers, vec!["mirror-00000001.json".to_string()]);
}

#[tokio::test]
async fn test_backwards_commit_is_rejected_by_durable_stores() {
    let dir = tempdir().unwrap();
    for kind in [StoreKind::Sqlite, StoreKind::Fs] {
        let store = AnyStore::open(&store_config(kind, dir.path().join(format!("{kind:?}"))))
            .unwrap();
        let rows = sample();
        store
            .commit(&order_lines(), Lsn::from(50), |w| w.replace_rows(&rows))
            .await
            .unwrap();

        let err = store
            .commit(&order_lines(), Lsn::from(49), |w| w.replace_rows(&RowSet::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommitConflict);
        assert_eq!(store.load_mirror(&order_lines()).await.unwrap(), Some(rows));
    }
}

#[tokio::test]
async fn test_failing_writer_rolls_back() {
    let dir = tempdir().unwrap();
    for kind in [StoreKind::Sqlite, StoreKind::Fs, StoreKind::Memory] {
        let store = AnyStore::open(&store_config(kind, dir.path().join(format!("{kind:?}"))))
            .unwrap();
        let rows = sample();
        let err = store
            .commit(&order_lines(), Lsn::from(3), |w| {
                w.replace_rows(&rows)?;
                Err(cdc_mirror::SyncError::Config("writer gave up".into()))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(store.checkpoint(&order_lines()).await.unwrap().is_none());
        assert!(store.load_mirror(&order_lines()).await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_reload_request_keeps_checkpoint_until_next_commit() {
    let dir = tempdir().unwrap();
    for kind in [StoreKind::Sqlite, StoreKind::Fs, StoreKind::Memory] {
        let store = AnyStore::open(&store_config(kind, dir.path().join(format!("{kind:?}"))))
            .unwrap();
        assert!(!store.request_full_reload(&order_lines()).await.unwrap());
        assert!(store.checkpoint(&order_lines()).await.unwrap().is_none());

        let rows = sample();
        store
            .commit(&order_lines(), Lsn::from(40), |w| w.replace_rows(&rows))
            .await
            .unwrap();
        assert!(store.request_full_reload(&order_lines()).await.unwrap());

        let marked = store.checkpoint(&order_lines()).await.unwrap().unwrap();
        assert!(marked.reload_requested, "{kind:?}");
        assert_eq!(marked.last_lsn, Lsn::from(40));
        assert_eq!(marked.row_count, 3);
        assert_eq!(store.load_mirror(&order_lines()).await.unwrap(), Some(rows));
        assert!(store.list().await.unwrap()[0].reload_requested);

        store
            .commit(&order_lines(), Lsn::from(41), |w| w.replace_rows(&RowSet::new()))
            .await
            .unwrap();
        let cleared = store.checkpoint(&order_lines()).await.unwrap().unwrap();
        assert!(!cleared.reload_requested, "{kind:?}");
    }
}
