// ABOUTME: SyncDaemon - continuous mirroring with one interval loop per table
// ABOUTME: Loops stop on a broadcast shutdown signal or after a fatal cycle failure

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

use crate::change::TableId;
use crate::checkpoint::CheckpointStore;
use crate::engine::{CycleResult, SyncEngine};
use crate::source::ChangeSource;

/// Why a table loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    FatalError,
}

/// Summary of one table loop.
#[derive(Debug, Clone, PartialEq)]
pub struct TableLoopReport {
    pub table: TableId,
    pub cycles: u64,
    pub committed: u64,
    pub failed: u64,
    pub stop_reason: StopReason,
}

/// Runs the sync engine on a schedule for a fixed set of tables.
///
/// Each table gets its own task, so a slow or failing table never delays another.
pub struct SyncDaemon<S, C> {
    engine: Arc<SyncEngine<S, C>>,
    tables: Vec<TableId>,
    interval: Duration,
}

impl<S, C> SyncDaemon<S, C>
where
    S: ChangeSource + 'static,
    C: CheckpointStore + 'static,
{
    pub fn new(engine: Arc<SyncEngine<S, C>>, tables: Vec<TableId>, interval: Duration) -> Self {
        Self {
            engine,
            tables,
            interval,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine<S, C>> {
        &self.engine
    }

    /// Run one cycle for every table and return immediately.
    pub async fn run_once(&self) -> Vec<CycleResult> {
        self.engine.run_all(&self.tables).await
    }

    /// Run until `shutdown` fires or every table loop has stopped.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Vec<TableLoopReport> {
        tracing::info!(
            "Starting SyncDaemon for {} tables with interval={:?}",
            self.tables.len(),
            self.interval
        );

        let handles: Vec<_> = self
            .tables
            .iter()
            .map(|table| {
                let engine = Arc::clone(&self.engine);
                let table = table.clone();
                let shutdown = shutdown.resubscribe();
                let period = self.interval;
                tokio::spawn(table_loop(engine, table, period, shutdown))
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        for (table, handle) in self.tables.iter().zip(handles) {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!("Sync loop for {} panicked: {}", table, e),
            }
        }
        tracing::info!("SyncDaemon stopped");
        reports
    }
}

async fn table_loop<S, C>(
    engine: Arc<SyncEngine<S, C>>,
    table: TableId,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> TableLoopReport
where
    S: ChangeSource,
    C: CheckpointStore,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = TableLoopReport {
        table: table.clone(),
        cycles: 0,
        committed: 0,
        failed: 0,
        stop_reason: StopReason::Shutdown,
    };

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received, stopping sync loop for {}", table);
                break;
            }
            _ = ticker.tick() => {
                report.cycles += 1;
                let mut stopping = false;
                let result = engine
                    .run_cycle_until(&table, async {
                        // A closed channel means the sender is gone, which is also a shutdown.
                        let _ = shutdown.recv().await;
                        stopping = true;
                    })
                    .await;

                if result.is_failed() {
                    report.failed += 1;
                } else if result.is_committed() {
                    report.committed += 1;
                }
                tracing::debug!(
                    "Cycle {} for {} finished: {:?} in {}ms",
                    report.cycles,
                    table,
                    result.status,
                    result.duration_ms
                );

                if stopping {
                    tracing::info!("Shutdown signal received during sync cycle for {}", table);
                    break;
                }
                if result.error_kind().is_some_and(|kind| kind.is_fatal()) {
                    tracing::error!(
                        "Stopping sync loop for {} after fatal {} error",
                        table,
                        result.error_kind().map(|k| k.as_str()).unwrap_or_default()
                    );
                    report.stop_reason = StopReason::FatalError;
                    break;
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{Columns, RowKey};
    use crate::checkpoint::MemoryStore;
    use crate::config::EngineConfig;
    use crate::lsn::Lsn;
    use crate::mirror::MirrorRow;
    use crate::source::MemorySource;
    use serde_json::json;

    fn row(id: i64) -> MirrorRow {
        let cols: Columns = json!({ "Name": format!("n{id}") }).as_object().cloned().unwrap();
        MirrorRow::new(RowKey::single(id), cols)
    }

    fn engine() -> Arc<SyncEngine<MemorySource, MemoryStore>> {
        let config = EngineConfig {
            source_retries: 0,
            ..EngineConfig::default()
        };
        Arc::new(SyncEngine::new(MemorySource::new(), MemoryStore::new(), config))
    }

    #[tokio::test]
    async fn test_fatal_table_stops_while_healthy_table_runs() {
        let engine = engine();
        let healthy = TableId::new("Customers").unwrap();
        let broken = TableId::new("Orders").unwrap();
        engine.source().set_snapshot(&healthy, vec![row(1)]);
        engine.source().set_current_lsn(Lsn::from(5));
        // Orders has no capture instance at all.

        let daemon = SyncDaemon::new(
            Arc::clone(&engine),
            vec![healthy.clone(), broken.clone()],
            Duration::from_millis(20),
        );
        let (tx, rx) = broadcast::channel(1);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let _ = tx.send(());
        });

        let reports = daemon.run(rx).await;
        stopper.await.unwrap();

        let broken_report = reports.iter().find(|r| r.table == broken).unwrap();
        assert_eq!(broken_report.stop_reason, StopReason::FatalError);
        assert_eq!(broken_report.cycles, 1);

        let healthy_report = reports.iter().find(|r| r.table == healthy).unwrap();
        assert_eq!(healthy_report.stop_reason, StopReason::Shutdown);
        assert!(healthy_report.cycles >= 2);
        assert_eq!(healthy_report.failed, 0);
        assert_eq!(engine.store().get(&healthy).await.unwrap(), Lsn::from(5));
    }

    #[tokio::test]
    async fn test_run_once_covers_every_table() {
        let engine = engine();
        let a = TableId::new("A").unwrap();
        let b = TableId::new("B").unwrap();
        engine.source().set_snapshot(&a, vec![row(1)]);
        engine.source().set_snapshot(&b, vec![row(1), row(2)]);
        engine.source().set_current_lsn(Lsn::from(9));

        let daemon = SyncDaemon::new(engine, vec![a, b], Duration::from_secs(60));
        let results = daemon.run_once().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_committed()));
        assert_eq!(results[1].rows_changed, 2);
    }
}
