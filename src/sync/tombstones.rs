// ABOUTME: Deletion log processor - the authoritative delete path
// ABOUTME: Applies tombstones in id order and marks them processed only after the delete succeeds

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::row::RowKey;
use super::source::SourceStore;
use super::target::TargetStore;
use crate::config::DeletionLogSettings;
use crate::registry::TableRegistry;
use crate::utils::RetryPolicy;

/// One row of the source's deletion log.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionLogEntry {
    pub id: i64,
    /// `table` or `schema.table`.
    pub table_name: String,
    /// The deleted row (at least its primary-key columns).
    pub payload: Value,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TombstoneStats {
    /// Deletes issued and marked processed.
    pub applied: u64,
    /// Marked processed without a delete (unknown or inactive table, unusable payload).
    pub skipped: u64,
    /// Deletes that failed after retries; left for the next cycle.
    pub failed: u64,
    pub batches: usize,
}

/// What to do with one entry.
enum Disposition {
    Applied,
    Skipped,
    Failed,
}

pub struct DeletionLogProcessor<'a> {
    source: &'a dyn SourceStore,
    target: &'a dyn TargetStore,
    registry: &'a TableRegistry,
    retry: RetryPolicy,
    batch_size: usize,
}

impl<'a> DeletionLogProcessor<'a> {
    pub fn new(
        source: &'a dyn SourceStore,
        target: &'a dyn TargetStore,
        registry: &'a TableRegistry,
        retry: RetryPolicy,
        settings: &DeletionLogSettings,
    ) -> Self {
        Self {
            source,
            target,
            registry,
            retry,
            batch_size: settings.batch_size.max(1),
        }
    }

    /// One sweep over the unprocessed log.
    ///
    /// Pages by id so entries whose delete failed are not re-read in the same sweep.
    /// A failure to read the log or to mark a batch processed ends the sweep with an
    /// error; the unmarked entries are picked up again next cycle.
    pub async fn run(&self) -> Result<TombstoneStats> {
        let mut stats = TombstoneStats::default();
        let mut after_id = i64::MIN;

        loop {
            let entries = self
                .source
                .fetch_deletion_log(after_id, self.batch_size)
                .await?;
            if entries.is_empty() {
                break;
            }
            stats.batches += 1;

            let mut done = Vec::with_capacity(entries.len());
            for entry in &entries {
                match self.apply(entry).await {
                    Disposition::Applied => {
                        stats.applied += 1;
                        done.push(entry.id);
                    }
                    Disposition::Skipped => {
                        stats.skipped += 1;
                        done.push(entry.id);
                    }
                    Disposition::Failed => stats.failed += 1,
                }
            }

            self.source
                .mark_deletions_processed(&done, Utc::now())
                .await
                .with_context(|| {
                    format!(
                        "Deletion log sweep stopped; {} applied entries will be replayed next cycle",
                        done.len()
                    )
                })?;

            if entries.len() < self.batch_size {
                break;
            }
            after_id = entries.iter().map(|e| e.id).max().unwrap_or(after_id);
        }

        if stats.applied + stats.skipped + stats.failed > 0 {
            tracing::info!(
                "Deletion log: {} applied, {} skipped, {} left for retry",
                stats.applied,
                stats.skipped,
                stats.failed
            );
        }
        Ok(stats)
    }

    async fn apply(&self, entry: &DeletionLogEntry) -> Disposition {
        let Some(table) = self.registry.find(&entry.table_name) else {
            tracing::warn!(
                "Deletion log entry {} names unknown table '{}', marking processed",
                entry.id,
                entry.table_name
            );
            return Disposition::Skipped;
        };
        if !table.is_active() {
            tracing::warn!(
                "Deletion log entry {} targets inactive table {}, marking processed",
                entry.id,
                table.qualified_name()
            );
            return Disposition::Skipped;
        }

        let Value::Object(payload) = &entry.payload else {
            tracing::warn!(
                "Deletion log entry {} for {} has a non-object payload, marking processed",
                entry.id,
                table.qualified_name()
            );
            return Disposition::Skipped;
        };

        let key = match RowKey::extract_or_missing(payload, &table.primary_keys) {
            Ok(key) => key,
            Err(missing) => {
                tracing::warn!(
                    "Deletion log entry {} for {} is missing key fields [{}], marking processed",
                    entry.id,
                    table.qualified_name(),
                    missing.join(", ")
                );
                return Disposition::Skipped;
            }
        };

        let label = format!("delete {} from {}", key, table.qualified_name());
        match self
            .retry
            .run(&label, || self.target.delete_row(table, &key))
            .await
        {
            Ok(_) => Disposition::Applied,
            Err(e) => {
                tracing::error!(
                    "Deletion log entry {} not applied, will retry next cycle: {:#}",
                    entry.id,
                    e
                );
                Disposition::Failed
            }
        }
    }
}
