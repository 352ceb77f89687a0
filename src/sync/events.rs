// ABOUTME: Realtime event queue and the single processor that drains it in FIFO order
// ABOUTME: Inserts/updates become retried upserts, deletes become retried key deletes

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::row::{Change, ChangeEvent, RowKey};
use super::target::TargetStore;
use crate::utils::RetryPolicy;

/// Create the shared event queue.
pub fn event_queue() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}

/// Producer half, cloned into every subscriber.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl EventSender {
    /// Enqueue an event. Fails only once the processor has stopped.
    pub fn send(&self, event: ChangeEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| anyhow!("event queue is closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by the [`EventProcessor`].
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    /// Stop accepting new events; already queued events are still delivered.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Applies queued events to the target one at a time.
///
/// Only one processor runs per process, so events for the same row are applied in
/// the order they were enqueued.
pub struct EventProcessor {
    target: Arc<dyn TargetStore>,
    retry: RetryPolicy,
    stats: ProcessorStats,
}

impl EventProcessor {
    pub fn new(target: Arc<dyn TargetStore>, retry: RetryPolicy) -> Self {
        Self {
            target,
            retry,
            stats: ProcessorStats::default(),
        }
    }

    /// Drain the queue until every sender is gone (or the queue is closed and empty).
    pub async fn run(mut self, mut queue: EventReceiver) -> ProcessorStats {
        while let Some(event) = queue.recv().await {
            self.process(event).await;
        }
        tracing::debug!(
            "Event processor stopped: {} applied, {} skipped, {} failed",
            self.stats.applied,
            self.stats.skipped,
            self.stats.failed
        );
        self.stats
    }

    /// Apply one event. Failures are logged and the event is dropped; the next
    /// reconciliation pass repairs whatever it missed.
    pub async fn process(&mut self, event: ChangeEvent) {
        let table = event.table.clone();
        let kind = event.change.kind();

        let result = match &event.change {
            Change::Insert(row) | Change::Update(row) => {
                let label = format!("{} {}", kind.as_str(), table.qualified_name());
                let rows = std::slice::from_ref(row);
                self.retry
                    .run(&label, || self.target.upsert_rows(&table, rows))
                    .await
                    .map(|_| ())
            }
            Change::Delete(old) => match RowKey::extract(old, &table.primary_keys) {
                Some(key) => {
                    let label = format!("delete {} from {}", key, table.qualified_name());
                    self.retry
                        .run(&label, || self.target.delete_row(&table, &key))
                        .await
                        .map(|_| ())
                }
                None => {
                    tracing::warn!(
                        "{}: delete event without primary key [{}], skipping",
                        table.qualified_name(),
                        table.primary_keys.join(", ")
                    );
                    self.stats.skipped += 1;
                    return;
                }
            },
        };

        match result {
            Ok(()) => {
                tracing::debug!("{}: applied {}", table.qualified_name(), kind.as_str());
                self.stats.applied += 1;
            }
            Err(e) => {
                tracing::error!(
                    "{}: dropping {} event: {:#}",
                    table.qualified_name(),
                    kind.as_str(),
                    e
                );
                self.stats.failed += 1;
            }
        }
    }

    pub fn stats(&self) -> ProcessorStats {
        self.stats
    }
}
