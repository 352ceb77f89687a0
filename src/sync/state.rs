// ABOUTME: Cursor store - durable per-table reconciliation progress
// ABOUTME: Persists a hand-editable JSON map keyed by "schema:table"

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;

/// Reconciliation progress for one table.
///
/// Every field except `cursor` has a default so a hand-edited entry still loads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorRecord {
    /// As-of time of the last successful incremental pass; null for full scans.
    #[serde(default)]
    pub cursor: Option<DateTime<Utc>>,
    /// Whether the initial backfill has completed.
    #[serde(default)]
    pub initialized: bool,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Rows applied by the last pass.
    #[serde(default)]
    pub last_batch_count: u64,
    #[serde(default)]
    pub full_scan: bool,
}

impl CursorRecord {
    /// Record for a successful incremental pass finishing at `now`.
    pub fn incremental(previous: Option<&CursorRecord>, now: DateTime<Utc>, rows: u64) -> Self {
        let synced_at = next_sync_time(previous, now);
        Self {
            cursor: Some(synced_at),
            initialized: true,
            last_synced_at: Some(synced_at),
            last_batch_count: rows,
            full_scan: false,
        }
    }

    /// Record for a successful full-scan pass finishing at `now`.
    pub fn full_scan(previous: Option<&CursorRecord>, now: DateTime<Utc>, rows: u64) -> Self {
        Self {
            cursor: None,
            initialized: true,
            last_synced_at: Some(next_sync_time(previous, now)),
            last_batch_count: rows,
            full_scan: true,
        }
    }
}

/// `now`, nudged past the previous sync time if the clock went backwards.
fn next_sync_time(previous: Option<&CursorRecord>, now: DateTime<Utc>) -> DateTime<Utc> {
    match previous.and_then(|p| p.last_synced_at) {
        Some(prev) if prev >= now => prev + chrono::Duration::milliseconds(1),
        _ => now,
    }
}

/// Durable map of cursor records.
///
/// Loaded once at startup; each table's reconciliation pass is the only writer of
/// its own entry.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    records: RwLock<BTreeMap<String, CursorRecord>>,
}

impl CursorStore {
    /// Empty store that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Load the state file. A missing file yields an empty store.
    pub async fn load(path: &Path) -> Result<Self> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(Self::new(path));
        }
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read cursor state from {:?}", path))?;
        let records: BTreeMap<String, CursorRecord> = if contents.trim().is_empty() {
            BTreeMap::new()
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse cursor state from {:?}", path))?
        };
        Ok(Self {
            path: path.to_path_buf(),
            records: RwLock::new(records),
        })
    }

    /// Load the state file, starting empty if it cannot be read.
    ///
    /// Starting empty makes every table re-run its initial backfill, which is safe
    /// because all writes are idempotent.
    pub async fn load_or_empty(path: &Path) -> Self {
        match Self::load(path).await {
            Ok(store) => {
                tracing::info!(
                    "Loaded cursor state for {} tables from {:?}",
                    store.len().await,
                    path
                );
                store
            }
            Err(e) => {
                tracing::warn!("{:#}. Starting with empty cursor state.", e);
                Self::new(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Option<CursorRecord> {
        self.records.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, record: CursorRecord) {
        self.records.write().await.insert(key.to_string(), record);
    }

    pub async fn remove(&self, key: &str) -> Option<CursorRecord> {
        self.records.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, CursorRecord> {
        self.records.read().await.clone()
    }

    /// Write the whole map to disk atomically (temp file + rename).
    pub async fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }

        let contents = {
            let records = self.records.read().await;
            serde_json::to_string_pretty(&*records).context("Failed to serialize cursor state")?
        };

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        fs::write(&tmp_path, contents)
            .await
            .with_context(|| format!("Failed to write cursor state to {:?}", tmp_path))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("Failed to move cursor state into {:?}", self.path))?;
        Ok(())
    }
}
