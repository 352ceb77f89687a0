// ABOUTME: SyncDaemon - supervises reconciliation cycles, realtime subscribers and the event processor
// ABOUTME: WorkerContext carries the stores, registry, cursor store and settings to every component

use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::events::{event_queue, EventProcessor, ProcessorStats};
use super::realtime::{RealtimeSubscriber, SubscriberStats};
use super::reconciler::Reconciler;
use super::source::SourceStore;
use super::state::CursorStore;
use super::target::TargetStore;
use super::tombstones::DeletionLogProcessor;
use crate::config::Settings;
use crate::registry::TableRegistry;
use crate::utils::RetryPolicy;

/// Everything the worker's tasks share, passed explicitly instead of living in globals.
pub struct WorkerContext {
    pub source: Arc<dyn SourceStore>,
    pub target: Arc<dyn TargetStore>,
    pub registry: Arc<TableRegistry>,
    pub cursors: Arc<CursorStore>,
    pub retry: RetryPolicy,
    pub settings: Settings,
    /// Signalled after every sync cycle; wakes subscribers whose channel closed.
    pub reconciled: Notify,
}

impl WorkerContext {
    pub fn new(
        source: Arc<dyn SourceStore>,
        target: Arc<dyn TargetStore>,
        registry: TableRegistry,
        cursors: CursorStore,
        settings: Settings,
    ) -> Self {
        Self {
            source,
            target,
            registry: Arc::new(registry),
            cursors: Arc::new(cursors),
            retry: settings.retry,
            settings,
            reconciled: Notify::new(),
        }
    }
}

/// Statistics from one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub tables_reconciled: usize,
    pub rows_upserted: u64,
    pub tombstones_applied: u64,
    pub tombstones_skipped: u64,
    pub tombstones_failed: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleStats {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub cycles: u64,
    pub last_cycle: Option<CycleStats>,
    pub events: ProcessorStats,
    pub subscribers: Vec<SubscriberStats>,
}

pub struct SyncDaemon {
    ctx: Arc<WorkerContext>,
}

impl SyncDaemon {
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<WorkerContext> {
        &self.ctx
    }

    /// Reconcile every eligible table, then sweep the deletion log once.
    ///
    /// A failing table only aborts its own pass. Each successful pass is persisted
    /// before moving on to the next table.
    pub async fn run_cycle(&self) -> CycleStats {
        let start = Instant::now();
        let mut stats = CycleStats::default();
        let ctx = &self.ctx;

        let reconciler = Reconciler::new(
            ctx.source.as_ref(),
            ctx.target.as_ref(),
            ctx.cursors.as_ref(),
            ctx.retry,
            &ctx.settings.reconcile,
        );

        for table in ctx.registry.reconcile_tables() {
            match reconciler.reconcile_table(table).await {
                Ok(result) => {
                    stats.tables_reconciled += 1;
                    stats.rows_upserted += result.rows;
                    if let Err(e) = ctx.cursors.save().await {
                        tracing::error!("Failed to persist cursor state: {:#}", e);
                        stats.errors.push(format!("{:#}", e));
                    }
                }
                Err(e) => {
                    tracing::error!("{}: {:#}", table.qualified_name(), e);
                    stats
                        .errors
                        .push(format!("{}: {:#}", table.qualified_name(), e));
                }
            }
        }

        if ctx.settings.deletion_log.enabled {
            let processor = DeletionLogProcessor::new(
                ctx.source.as_ref(),
                ctx.target.as_ref(),
                ctx.registry.as_ref(),
                ctx.retry,
                &ctx.settings.deletion_log,
            );
            match processor.run().await {
                Ok(tombstones) => {
                    stats.tombstones_applied = tombstones.applied;
                    stats.tombstones_skipped = tombstones.skipped;
                    stats.tombstones_failed = tombstones.failed;
                }
                Err(e) => {
                    tracing::error!("Deletion log sweep failed: {:#}", e);
                    stats.errors.push(format!("deletion log: {:#}", e));
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        ctx.reconciled.notify_waiters();
        stats
    }

    /// Run until the work for the configured mode is done or shutdown is signalled.
    ///
    /// - neither realtime nor loop: one cycle, then return
    /// - loop: a cycle every interval (the first immediately)
    /// - realtime without loop: one cycle, then serve realtime events until shutdown
    pub async fn run(&self, shutdown: &broadcast::Sender<()>) -> Result<RunSummary> {
        let ctx = &self.ctx;
        let mode = ctx.settings.run;
        let mut summary = RunSummary::default();
        let mut shutdown_rx = shutdown.subscribe();

        tracing::info!(
            "Starting sync worker: {} tables, realtime={}, loop={}, interval={:?}",
            ctx.registry.len(),
            mode.realtime,
            mode.loop_enabled,
            ctx.settings.reconcile.interval
        );

        if mode.is_single_pass() {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Shutdown signal received before the sync cycle finished");
                }
                stats = self.run_cycle() => {
                    log_cycle(1, &stats);
                    summary.cycles = 1;
                    summary.last_cycle = Some(stats);
                }
            }
            self.persist().await;
            return Ok(summary);
        }

        let (events_tx, events_rx) = event_queue();
        let processor = tokio::spawn(EventProcessor::new(ctx.target.clone(), ctx.retry).run(events_rx));

        let mut subscribers: Vec<JoinHandle<SubscriberStats>> = Vec::new();
        if mode.realtime {
            for table in ctx.registry.realtime_tables() {
                let subscriber =
                    RealtimeSubscriber::new(ctx.clone(), table.clone(), events_tx.clone());
                subscribers.push(tokio::spawn(subscriber.run(shutdown.subscribe())));
            }
            tracing::info!("Realtime enabled for {} tables", subscribers.len());
        }
        // Subscribers hold the only senders; the processor stops once they are gone.
        drop(events_tx);

        if mode.loop_enabled {
            let mut ticker = interval(ctx.settings.reconcile.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.recv() => {
                        tracing::info!("Shutdown signal received, stopping sync worker");
                        break;
                    }
                    _ = ticker.tick() => {
                        let cycle = summary.cycles + 1;
                        tracing::info!("Starting sync cycle {}", cycle);
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.recv() => {
                                tracing::info!("Shutdown signal received during sync cycle, aborting");
                                break;
                            }
                            stats = self.run_cycle() => {
                                log_cycle(cycle, &stats);
                                summary.cycles = cycle;
                                summary.last_cycle = Some(stats);
                            }
                        }
                    }
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {}
                stats = self.run_cycle() => {
                    log_cycle(1, &stats);
                    summary.cycles = 1;
                    summary.last_cycle = Some(stats);
                    tracing::info!("Initial sync cycle done, serving realtime events until shutdown");
                    let _ = shutdown_rx.recv().await;
                }
            }
            tracing::info!("Shutdown signal received, stopping sync worker");
        }

        // A break out of the loop may not have come from the sender (e.g. cycle
        // abort), so make sure every subscriber sees the signal.
        let _ = shutdown.send(());

        for handle in subscribers {
            match handle.await {
                Ok(stats) => summary.subscribers.push(stats),
                Err(e) => tracing::warn!("Realtime subscriber task failed: {}", e),
            }
        }

        let grace = ctx.settings.realtime.shutdown_grace;
        let mut processor = processor;
        match tokio::time::timeout(grace, &mut processor).await {
            Ok(Ok(stats)) => summary.events = stats,
            Ok(Err(e)) => tracing::warn!("Event processor task failed: {}", e),
            Err(_) => {
                tracing::warn!(
                    "Event processor did not drain within {:?}, dropping remaining events",
                    grace
                );
                processor.abort();
            }
        }

        self.persist().await;
        Ok(summary)
    }

    async fn persist(&self) {
        match self.ctx.cursors.save().await {
            Ok(()) => tracing::debug!("Cursor state saved to {:?}", self.ctx.cursors.path()),
            Err(e) => tracing::error!("Failed to persist cursor state: {:#}", e),
        }
    }
}

fn log_cycle(cycle: u64, stats: &CycleStats) {
    tracing::info!(
        "Sync cycle {} completed: {} tables, {} rows, {} tombstones applied, {} skipped in {}ms",
        cycle,
        stats.tables_reconciled,
        stats.rows_upserted,
        stats.tombstones_applied,
        stats.tombstones_skipped,
        stats.duration_ms
    );
    if !stats.is_success() {
        tracing::warn!("Sync cycle {} had {} errors", cycle, stats.errors.len());
    }
}
