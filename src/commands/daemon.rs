// ABOUTME: Daemon command - runs the per-table sync loops until Ctrl+C
// ABOUTME: Wires a broadcast shutdown channel to the SyncDaemon

use std::sync::Arc;

use anyhow::Result;
use clap::Args;

use super::{build_engine, load_config, ConfigArgs};
use crate::daemon::{StopReason, SyncDaemon};

#[derive(Args, Debug)]
pub struct DaemonArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn command(args: DaemonArgs) -> Result<()> {
    let config = load_config(&args.config.config)?;
    let tables = config.table_ids()?;
    let engine = Arc::new(build_engine(&config)?);
    let daemon = SyncDaemon::new(engine, tables, config.daemon.interval());

    println!();
    println!("========================================");
    println!("Starting continuous CDC mirroring");
    println!("========================================");
    println!("  Tables: {}", config.tables.len());
    println!("  Sync interval: {}s", config.daemon.interval_secs);
    println!("  Press Ctrl+C to stop");
    println!();

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        }
        let _ = signal_tx.send(());
    });

    let reports = daemon.run(shutdown_rx).await;
    for report in &reports {
        let reason = match report.stop_reason {
            StopReason::Shutdown => "shutdown",
            StopReason::FatalError => "fatal error",
        };
        println!(
            "{}: {} cycles, {} committed, {} failed (stopped: {})",
            report.table, report.cycles, report.committed, report.failed, reason
        );
    }
    drop(shutdown_tx);
    Ok(())
}
