// ABOUTME: CLI entry point for cdc-mirror
// ABOUTME: Parses commands and routes to the appropriate handlers

use cdc_mirror::commands::{self, daemon::DaemonArgs, reset::ResetArgs, status::StatusArgs, sync::SyncArgs};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cdc-mirror")]
#[command(about = "Keep mirrors of CDC-enabled tables in sync using LSN checkpoints", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle for the configured tables
    Sync(SyncArgs),
    /// Run sync cycles on the configured interval until Ctrl+C
    Daemon(DaemonArgs),
    /// Show the checkpoint of every configured table
    Status(StatusArgs),
    /// Drop a table's checkpoint and mirror so the next sync reloads it
    Reset(ResetArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG has precedence over --log.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Sync(args) => commands::sync::command(args).await,
        Commands::Daemon(args) => commands::daemon::command(args).await,
        Commands::Status(args) => commands::status::command(args).await,
        Commands::Reset(args) => commands::reset::command(args).await,
    }
}
