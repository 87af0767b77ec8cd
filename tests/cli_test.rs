// ABOUTME: End-to-end tests of the cdc-mirror binary against a CDC export directory
// ABOUTME: Covers full load, incremental sync, status, reset and failure exit codes

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn write_export(root: &Path) {
    let customers = root.join("export").join("Customers");
    fs::create_dir_all(&customers).unwrap();
    fs::write(root.join("export").join("current_lsn"), "0x00000000000000000010\n").unwrap();
    fs::write(
        customers.join("capture.json"),
        r#"{ "capture_instance": "dbo_Customers", "primary_key": ["Id"] }"#,
    )
    .unwrap();
    fs::write(
        customers.join("snapshot.jsonl"),
        concat!(
            r#"{"Id": 1, "Name": "Ada", "City": "London"}"#,
            "\n",
            r#"{"Id": 2, "Name": "Grace", "City": "Arlington"}"#,
            "\n",
        ),
    )
    .unwrap();
    fs::write(customers.join("changes.jsonl"), "").unwrap();
}

fn write_config(root: &Path, store_kind: &str) -> std::path::PathBuf {
    let config = format!(
        r#"
[engine]
source_retries = 0
retry_delay_ms = 1

[store]
kind = "{store_kind}"
path = "state"

[source]
path = "export"

[[tables]]
name = "Customers"

[[tables]]
name = "Orders"
"#
    );
    let path = root.join("cdc-mirror.toml");
    fs::write(&path, config).unwrap();
    path
}

fn run(config: &Path, args: &[&str]) -> Output {
    let bin_path = env!("CARGO_BIN_EXE_cdc-mirror");
    Command::new(bin_path)
        .args(args)
        .arg("--config")
        .arg(config)
        .env_remove("RUST_LOG")
        .env_remove("CDC_MIRROR_CONFIG")
        .output()
        .expect("Failed to execute command")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn sync_lifecycle(store_kind: &str) {
    let temp_dir = tempdir().unwrap();
    write_export(temp_dir.path());
    let config = write_config(temp_dir.path(), store_kind);

    // First sync of a table is a full load; the checkpoint is just past the max LSN
    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    let out = stdout(&output);
    assert!(out.contains("Customers: committed (full load) lsn=0x00000000000000000011 rows_changed=2"));

    // Nothing new in the change log
    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Customers: no changes since 0x00000000000000000011"));

    // An update and a delete, the delete sitting exactly at the new max LSN
    let export = temp_dir.path().join("export");
    fs::write(
        export.join("Customers").join("changes.jsonl"),
        concat!(
            r#"{"__$start_lsn": "0x00000000000000000018", "__$seqval": "0x00000000000000000001", "__$operation": 3, "Id": 1, "Name": "Ada", "City": "London"}"#,
            "\n",
            r#"{"__$start_lsn": "0x00000000000000000018", "__$seqval": "0x00000000000000000001", "__$operation": 4, "Id": 1, "Name": "Ada", "City": "Cambridge"}"#,
            "\n",
            r#"{"__$start_lsn": "0x00000000000000000019", "__$seqval": "0x00000000000000000002", "__$operation": 1, "Id": 2, "Name": "Grace", "City": "Arlington"}"#,
            "\n",
        ),
    )
    .unwrap();
    fs::write(export.join("current_lsn"), "0x00000000000000000019").unwrap();

    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(output.status.success());
    assert!(stdout(&output)
        .contains("Customers: committed (incremental load) lsn=0x0000000000000000001A rows_changed=2"));

    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(stdout(&output).contains("Customers: no changes since 0x0000000000000000001A"));

    // Status lists the checkpoint and the table that never synced
    let output = run(&config, &["status"]);
    assert!(output.status.success());
    let out = stdout(&output);
    let customers = out.lines().find(|l| l.starts_with("Customers")).unwrap();
    assert!(customers.contains("0x0000000000000000001A"));
    assert_eq!(customers.split_whitespace().nth(2), Some("1"));
    let orders = out.lines().find(|l| l.starts_with("Orders")).unwrap();
    assert!(orders.contains("never synced"));

    // Reset drops the checkpoint so the next sync reloads
    let output = run(&config, &["reset", "--table", "Customers"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Customers: reset, next sync performs a full load"));
    let output = run(&config, &["reset", "--table", "Customers"]);
    assert!(stdout(&output).contains("Customers: nothing to reset"));

    fs::write(
        export.join("Customers").join("snapshot.jsonl"),
        r#"{"Id": 1, "Name": "Ada", "City": "Cambridge"}"#,
    )
    .unwrap();
    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(output.status.success());
    assert!(stdout(&output)
        .contains("Customers: committed (full load) lsn=0x0000000000000000001A rows_changed=1"));
}

#[test]
fn test_sync_lifecycle_with_sqlite_store() {
    sync_lifecycle("sqlite");
}

#[test]
fn test_sync_lifecycle_with_fs_store() {
    sync_lifecycle("fs");
}

#[test]
fn test_uncaptured_table_fails_the_run() {
    let temp_dir = tempdir().unwrap();
    write_export(temp_dir.path());
    let config = write_config(temp_dir.path(), "sqlite");

    let output = run(&config, &["sync"]);
    assert!(!output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Customers: committed (full load)"));
    assert!(out.contains("Orders: failed [capture_not_enabled]"));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("1 of 2 tables failed to sync"));
}

#[test]
fn test_unknown_table_is_rejected() {
    let temp_dir = tempdir().unwrap();
    write_export(temp_dir.path());
    let config = write_config(temp_dir.path(), "fs");

    let output = run(&config, &["sync", "--table", "Invoices"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Table 'Invoices' is not configured"));
}

#[test]
fn test_missing_config_is_reported() {
    let temp_dir = tempdir().unwrap();
    let output = run(&temp_dir.path().join("absent.toml"), &["status"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load config"));
}

#[test]
fn test_cleaned_up_range_reloads_in_the_next_run() {
    let temp_dir = tempdir().unwrap();
    write_export(temp_dir.path());
    let config = write_config(temp_dir.path(), "fs");

    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(output.status.success());

    // Retention cleanup moved past the checkpoint
    let export = temp_dir.path().join("export");
    fs::write(
        export.join("Customers").join("capture.json"),
        r#"{ "capture_instance": "dbo_Customers", "primary_key": ["Id"], "min_lsn": "0x00000000000000000030" }"#,
    )
    .unwrap();
    fs::write(export.join("current_lsn"), "0x00000000000000000040").unwrap();

    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(!output.status.success());
    assert!(stdout(&output).contains("Customers: failed [range_unavailable]"));

    let output = run(&config, &["status"]);
    let out = stdout(&output);
    let customers = out.lines().find(|l| l.starts_with("Customers")).unwrap();
    assert!(customers.contains("0x00000000000000000011"));
    assert!(customers.contains("(full reload pending)"));

    // A fresh process still knows the table needs a full load
    let output = run(&config, &["sync", "--table", "Customers"]);
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(stdout(&output)
        .contains("Customers: committed (full load) lsn=0x00000000000000000041 rows_changed=2"));

    let output = run(&config, &["status"]);
    assert!(!stdout(&output).contains("full reload pending"));
}
