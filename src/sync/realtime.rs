// ABOUTME: Realtime subscriber - keeps one change subscription open per table
// ABOUTME: Forwards notifications to the event queue and resubscribes after channel errors

use std::sync::Arc;
use tokio::sync::broadcast;

use super::daemon::WorkerContext;
use super::events::EventSender;
use super::row::ChangeEvent;
use super::source::{ChannelMessage, ChannelStatus, Subscription};
use crate::registry::TableSpec;

/// Cap on the backoff multiplier between resubscribe attempts.
const MAX_BACKOFF_STEPS: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriberStats {
    /// Notifications forwarded to the queue.
    pub events: u64,
    /// Subscriptions that failed (error or timeout) and were reopened.
    pub resubscribes: u64,
    /// Times the channel closed before being reopened.
    pub closes: u64,
}

/// How a subscription ended.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    Shutdown,
    Failed,
    Closed,
}

pub struct RealtimeSubscriber {
    ctx: Arc<WorkerContext>,
    table: Arc<TableSpec>,
    events: EventSender,
    stats: SubscriberStats,
}

impl RealtimeSubscriber {
    pub fn new(ctx: Arc<WorkerContext>, table: Arc<TableSpec>, events: EventSender) -> Self {
        Self {
            ctx,
            table,
            events,
            stats: SubscriberStats::default(),
        }
    }

    /// Keep the table subscribed until shutdown.
    ///
    /// `ChannelError` and `TimedOut` reopen the subscription after
    /// `resubscribe_delay * consecutive_failures` (capped). `Closed` parks the
    /// subscriber until the next reconciliation cycle has run, then reopens; without
    /// a reconciliation loop it reopens after `resubscribe_delay` instead.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> SubscriberStats {
        let name = self.table.qualified_name();
        let mut failures = 0u32;

        loop {
            let opened = tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                opened = self.ctx.source.subscribe(&self.table) => opened,
            };

            let ended = match opened {
                Ok(subscription) => self.pump(subscription, &mut shutdown, &mut failures).await,
                Err(e) => {
                    tracing::warn!("{}: subscribe failed: {:#}", name, e);
                    Ended::Failed
                }
            };

            match ended {
                Ended::Shutdown => break,
                Ended::Failed => {
                    failures = failures.saturating_add(1);
                    self.stats.resubscribes += 1;
                    let delay = self
                        .ctx
                        .settings
                        .realtime
                        .resubscribe_delay
                        .saturating_mul(failures.min(MAX_BACKOFF_STEPS));
                    tracing::info!("{}: resubscribing in {:?}", name, delay);
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Ended::Closed => {
                    self.stats.closes += 1;
                    if self.ctx.settings.run.loop_enabled {
                        tracing::warn!(
                            "{}: realtime channel closed, waiting for the next reconciliation pass",
                            name
                        );
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => break,
                            _ = self.ctx.reconciled.notified() => {}
                        }
                    } else {
                        // No reconciliation loop will wake us; reopen on the base delay.
                        let delay = self.ctx.settings.realtime.resubscribe_delay;
                        tracing::warn!(
                            "{}: realtime channel closed, resubscribing in {:?}",
                            name,
                            delay
                        );
                        tokio::select! {
                            biased;
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        tracing::debug!("{}: subscriber stopped", name);
        self.stats
    }

    async fn pump(
        &mut self,
        mut subscription: Subscription,
        shutdown: &mut broadcast::Receiver<()>,
        failures: &mut u32,
    ) -> Ended {
        let name = self.table.qualified_name();

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    subscription.unsubscribe();
                    return Ended::Shutdown;
                }
                message = subscription.next() => message,
            };

            match message {
                Some(ChannelMessage::Status(ChannelStatus::Connecting)) => {
                    tracing::debug!("{}: connecting", name);
                }
                Some(ChannelMessage::Status(ChannelStatus::Subscribed)) => {
                    tracing::info!("{}: subscribed to {}", name, self.table.channel);
                    *failures = 0;
                }
                Some(ChannelMessage::Status(ChannelStatus::ChannelError(e))) => {
                    tracing::warn!("{}: channel error: {}", name, e);
                    return Ended::Failed;
                }
                Some(ChannelMessage::Status(ChannelStatus::TimedOut)) => {
                    tracing::warn!("{}: subscription timed out", name);
                    return Ended::Failed;
                }
                Some(ChannelMessage::Status(ChannelStatus::Closed)) | None => {
                    return Ended::Closed;
                }
                Some(ChannelMessage::Change(raw)) => {
                    let event_type = raw.event_type.clone();
                    let Some(change) = raw.into_change() else {
                        tracing::warn!(
                            "{}: ignoring '{}' notification without a usable payload",
                            name,
                            event_type
                        );
                        continue;
                    };
                    if self
                        .events
                        .send(ChangeEvent::new(self.table.clone(), change))
                        .is_err()
                    {
                        subscription.unsubscribe();
                        return Ended::Shutdown;
                    }
                    self.stats.events += 1;
                }
            }
        }
    }
}
