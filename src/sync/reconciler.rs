// ABOUTME: Reconciliation engine - rescans recently modified source rows and re-upserts them
// ABOUTME: Incremental passes use a cursor plus look-back window; tables without one get a full scan

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

use super::source::SourceStore;
use super::state::{CursorRecord, CursorStore};
use super::target::TargetStore;
use crate::config::ReconcileSettings;
use crate::registry::{ReplicationMode, TableSpec};
use crate::utils::RetryPolicy;

/// Outcome of one successful pass over one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub rows: u64,
    pub pages: usize,
    /// Lower bound used for an incremental pass; `None` for a full scan.
    pub since: Option<DateTime<Utc>>,
}

/// Start of the range rescanned by an incremental pass.
///
/// The look-back window always wins when it reaches further back than the stored
/// cursor, so every pass re-reads at least `lookback` worth of changes. A table that
/// has never completed a pass starts from `now - initial_backfill` instead.
pub fn since_timestamp(
    now: DateTime<Utc>,
    record: Option<&CursorRecord>,
    lookback: Duration,
    initial_backfill: Duration,
) -> DateTime<Utc> {
    let lookback_start = window_start(now, lookback);
    let fallback = match record {
        Some(r) if r.initialized => lookback_start,
        _ => window_start(now, initial_backfill),
    };
    let from_cursor = record.and_then(|r| r.cursor).unwrap_or(fallback);
    from_cursor.min(lookback_start)
}

/// `now - window`, clamped to the earliest representable time.
fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Runs reconciliation passes for individual tables.
pub struct Reconciler<'a> {
    source: &'a dyn SourceStore,
    target: &'a dyn TargetStore,
    cursors: &'a CursorStore,
    retry: RetryPolicy,
    settings: &'a ReconcileSettings,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        source: &'a dyn SourceStore,
        target: &'a dyn TargetStore,
        cursors: &'a CursorStore,
        retry: RetryPolicy,
        settings: &'a ReconcileSettings,
    ) -> Self {
        Self {
            source,
            target,
            cursors,
            retry,
            settings,
        }
    }

    /// Reconcile one table and record its cursor on success.
    ///
    /// Any failed read or exhausted upsert aborts the pass and leaves the stored
    /// cursor untouched, so the next interval rescans the same range.
    pub async fn reconcile_table(&self, table: &TableSpec) -> Result<ReconcileResult> {
        let key = table.state_key();
        let previous = self.cursors.get(&key).await;

        let result = match &table.mode {
            ReplicationMode::Incremental { field } => {
                let since = since_timestamp(
                    Utc::now(),
                    previous.as_ref(),
                    self.settings.lookback,
                    self.settings.initial_backfill,
                );
                tracing::debug!(
                    "{}: incremental pass on {} since {}",
                    table.qualified_name(),
                    field,
                    since.to_rfc3339()
                );
                self.incremental_pass(table, field, since).await?
            }
            ReplicationMode::FullScan => self.full_scan_pass(table).await?,
            mode => anyhow::bail!(
                "{} is not reconcilable in mode {}",
                table.qualified_name(),
                mode
            ),
        };

        let now = Utc::now();
        let record = if result.since.is_some() {
            CursorRecord::incremental(previous.as_ref(), now, result.rows)
        } else {
            CursorRecord::full_scan(previous.as_ref(), now, result.rows)
        };
        self.cursors.set(&key, record).await;

        tracing::info!(
            "{}: reconciled {} rows in {} pages",
            table.qualified_name(),
            result.rows,
            result.pages
        );
        Ok(result)
    }

    async fn incremental_pass(
        &self,
        table: &TableSpec,
        field: &str,
        since: DateTime<Utc>,
    ) -> Result<ReconcileResult> {
        let batch_size = self.settings.batch_size.max(1);
        let mut offset = 0usize;
        let mut rows = 0u64;
        let mut pages = 0usize;

        loop {
            let page = self
                .source
                .fetch_since(table, field, since, offset, batch_size)
                .await
                .with_context(|| format!("Reconciliation of {} aborted", table.qualified_name()))?;
            pages += 1;
            rows += self.apply_page(table, &page).await?;

            if page.len() < batch_size {
                break;
            }
            offset += page.len();
        }

        Ok(ReconcileResult {
            rows,
            pages,
            since: Some(since),
        })
    }

    async fn full_scan_pass(&self, table: &TableSpec) -> Result<ReconcileResult> {
        let batch_size = self.settings.batch_size.max(1);
        let mut offset = 0usize;
        let mut rows = 0u64;
        let mut pages = 0usize;

        loop {
            let page = self
                .source
                .fetch_ordered(table, offset, batch_size)
                .await
                .with_context(|| format!("Full scan of {} aborted", table.qualified_name()))?;
            pages += 1;
            rows += self.apply_page(table, &page).await?;

            if page.len() < batch_size {
                break;
            }
            offset += page.len();
        }

        Ok(ReconcileResult {
            rows,
            pages,
            since: None,
        })
    }

    async fn apply_page(&self, table: &TableSpec, page: &[super::row::Row]) -> Result<u64> {
        if page.is_empty() {
            return Ok(0);
        }
        let label = format!("upsert {} rows into {}", page.len(), table.qualified_name());
        self.retry
            .run(&label, || self.target.upsert_rows(table, page))
            .await?;
        Ok(page.len() as u64)
    }
}
