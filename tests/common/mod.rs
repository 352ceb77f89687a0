// ABOUTME: In-memory source and target stores for driving the sync pipeline in tests
// ABOUTME: Records every call and supports failure injection on reads, writes and subscriptions

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use sync_worker::config::{FileConfig, Overrides, Settings, TableDefaults, TableEntry};
use sync_worker::registry::{ReplicationMode, TableSpec};
use sync_worker::sync::{
    ChannelMessage, DeletionLogEntry, ProbeError, Row, RowKey, SourceStore, Subscription,
    TargetStore,
};
use tokio::sync::mpsc;

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

pub fn ts(value: DateTime<Utc>) -> Value {
    Value::String(value.to_rfc3339())
}

/// Table spec from a config entry, with the mode already resolved.
pub fn table(entry: &str, mode: ReplicationMode) -> TableSpec {
    let entry: TableEntry = serde_json::from_str(entry).unwrap();
    let mut spec = TableSpec::from_config(entry.into_config(), &TableDefaults::default()).unwrap();
    spec.mode = mode;
    spec
}

pub fn incremental(field: &str) -> ReplicationMode {
    ReplicationMode::Incremental {
        field: field.to_string(),
    }
}

/// Settings with fast retries and the given extra config merged in.
pub fn settings(reconciliation: &str) -> Settings {
    let config = FileConfig::parse(&format!(
        r#"{{
            "tables": [],
            "reconciliation": {},
            "retry": {{"maxAttempts": 3, "baseDelayMs": 1}},
            "realtime": {{"resubscribeDelayMs": 10, "shutdownGraceMs": 1000}}
        }}"#,
        reconciliation
    ))
    .unwrap();
    Settings::resolve(&config, &Overrides::default()).unwrap()
}

fn sort_key(value: Option<&Value>) -> (i64, String) {
    match value {
        Some(Value::Number(n)) => (n.as_i64().unwrap_or_default(), String::new()),
        Some(Value::String(s)) => (0, s.clone()),
        Some(other) => (0, other.to_string()),
        None => (0, String::new()),
    }
}

fn parse_ts(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|d| d.with_timezone(&Utc))
}

#[derive(Debug, Default)]
struct SourceTable {
    columns: HashSet<String>,
    rows: Vec<Row>,
}

/// Scripted behavior for one `subscribe` call.
pub enum SubscribeScript {
    /// Deliver these messages; keep the channel open afterwards if `keep_open`.
    Messages {
        messages: Vec<ChannelMessage>,
        keep_open: bool,
    },
    /// `subscribe` itself returns an error.
    Fail(String),
}

#[derive(Default)]
pub struct FakeSource {
    tables: Mutex<HashMap<String, SourceTable>>,
    deletion_log: Mutex<Vec<DeletionLogEntry>>,
    scripts: Mutex<VecDeque<SubscribeScript>>,
    open_channels: Mutex<Vec<mpsc::UnboundedSender<ChannelMessage>>>,
    /// Table whose reads fail once `offset >= the given value`.
    fail_reads: Mutex<Option<(String, usize)>>,
    fail_marks: Mutex<bool>,
    pub probes: Mutex<Vec<(String, Option<String>)>>,
    pub reads: Mutex<Vec<(String, usize, usize)>>,
    pub since_seen: Mutex<Vec<DateTime<Utc>>>,
    pub mark_calls: AtomicUsize,
    pub subscribe_calls: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table with the given columns.
    pub fn add_table(&self, qualified: &str, columns: &[&str]) {
        self.tables.lock().unwrap().insert(
            qualified.to_string(),
            SourceTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, qualified: &str, row: Row) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(qualified).expect("unknown table");
        if let Some(id) = row.get("id") {
            table.rows.retain(|r| r.get("id") != Some(id));
        }
        table.rows.push(row);
    }

    pub fn remove(&self, qualified: &str, id: i64) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(qualified).expect("unknown table");
        table.rows.retain(|r| r.get("id") != Some(&Value::from(id)));
    }

    pub fn log_deletion(&self, id: i64, table_name: &str, payload: Value) {
        self.deletion_log.lock().unwrap().push(DeletionLogEntry {
            id,
            table_name: table_name.to_string(),
            payload,
            processed_at: None,
        });
    }

    pub fn deletion_log(&self) -> Vec<DeletionLogEntry> {
        self.deletion_log.lock().unwrap().clone()
    }

    pub fn processed_ids(&self) -> Vec<i64> {
        self.deletion_log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.processed_at.is_some())
            .map(|e| e.id)
            .collect()
    }

    pub fn fail_reads_from(&self, qualified: &str, offset: usize) {
        *self.fail_reads.lock().unwrap() = Some((qualified.to_string(), offset));
    }

    pub fn clear_read_failures(&self) {
        *self.fail_reads.lock().unwrap() = None;
    }

    pub fn set_fail_marks(&self, fail: bool) {
        *self.fail_marks.lock().unwrap() = fail;
    }

    pub fn script(&self, script: SubscribeScript) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Deliver a message on every channel that is still open.
    pub fn send_to_open_channels(&self, message: ChannelMessage) {
        for tx in self.open_channels.lock().unwrap().iter() {
            let _ = tx.send(message.clone());
        }
    }

    fn check_read(&self, qualified: &str, offset: usize) -> Result<()> {
        if let Some((table, from)) = self.fail_reads.lock().unwrap().as_ref() {
            if table == qualified && offset >= *from {
                bail!("injected read failure on {} at offset {}", qualified, offset);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceStore for FakeSource {
    async fn probe(&self, table: &TableSpec, field: Option<&str>) -> Result<(), ProbeError> {
        let qualified = table.qualified_name();
        self.probes
            .lock()
            .unwrap()
            .push((qualified.clone(), field.map(str::to_string)));
        let tables = self.tables.lock().unwrap();
        let Some(source) = tables.get(&qualified) else {
            return Err(ProbeError::MissingTable(qualified));
        };
        match field {
            Some(field) if !source.columns.contains(field) => Err(ProbeError::Unusable(anyhow!(
                "column \"{}\" does not exist",
                field
            ))),
            _ => Ok(()),
        }
    }

    async fn fetch_since(
        &self,
        table: &TableSpec,
        field: &str,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>> {
        let qualified = table.qualified_name();
        self.reads.lock().unwrap().push((qualified.clone(), offset, limit));
        self.since_seen.lock().unwrap().push(since);
        self.check_read(&qualified, offset)?;

        let tables = self.tables.lock().unwrap();
        let source = tables
            .get(&qualified)
            .ok_or_else(|| anyhow!("relation {} does not exist", qualified))?;
        let mut rows: Vec<Row> = source
            .rows
            .iter()
            .filter(|r| parse_ts(r.get(field)).is_some_and(|t| t >= since))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            parse_ts(a.get(field))
                .cmp(&parse_ts(b.get(field)))
                .then_with(|| sort_key(a.get("id")).cmp(&sort_key(b.get("id"))))
        });
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_ordered(&self, table: &TableSpec, offset: usize, limit: usize) -> Result<Vec<Row>> {
        let qualified = table.qualified_name();
        self.reads.lock().unwrap().push((qualified.clone(), offset, limit));
        self.check_read(&qualified, offset)?;

        let tables = self.tables.lock().unwrap();
        let source = tables
            .get(&qualified)
            .ok_or_else(|| anyhow!("relation {} does not exist", qualified))?;
        let mut rows = source.rows.clone();
        rows.sort_by(|a, b| {
            let ka: Vec<_> = table.primary_keys.iter().map(|k| sort_key(a.get(k))).collect();
            let kb: Vec<_> = table.primary_keys.iter().map(|k| sort_key(b.get(k))).collect();
            ka.cmp(&kb)
        });
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn fetch_deletion_log(&self, after_id: i64, limit: usize) -> Result<Vec<DeletionLogEntry>> {
        let mut entries: Vec<DeletionLogEntry> = self
            .deletion_log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.processed_at.is_none() && e.id > after_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn mark_deletions_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> Result<()> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_marks.lock().unwrap() {
            bail!("injected failure marking deletion log entries");
        }
        for entry in self.deletion_log.lock().unwrap().iter_mut() {
            if ids.contains(&entry.id) {
                entry.processed_at = Some(processed_at);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, _table: &TableSpec) -> Result<Subscription> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front();
        let (tx, rx) = mpsc::unbounded_channel();
        match script {
            Some(SubscribeScript::Fail(message)) => bail!(message),
            Some(SubscribeScript::Messages {
                messages,
                keep_open,
            }) => {
                for message in messages {
                    let _ = tx.send(message);
                }
                if keep_open {
                    self.open_channels.lock().unwrap().push(tx);
                }
            }
            None => self.open_channels.lock().unwrap().push(tx),
        }
        Ok(Subscription::new(rx, None))
    }
}

/// A recorded target write.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetCall {
    Upsert { table: String, rows: usize },
    Delete { table: String, key: String },
}

#[derive(Default)]
pub struct FakeTarget {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    /// Upserts that fail before the next one succeeds.
    transient_upsert_failures: AtomicU32,
    fail_all_upserts: Mutex<bool>,
    fail_deletes: Mutex<HashSet<String>>,
    pub calls: Mutex<Vec<TargetCall>>,
    pub upsert_attempts: AtomicUsize,
    pub delete_attempts: AtomicUsize,
}

impl FakeTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, qualified: &str, key: &str) -> Option<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(qualified)
            .and_then(|t| t.get(key).cloned())
    }

    pub fn count(&self, qualified: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(qualified)
            .map_or(0, |t| t.len())
    }

    pub fn seed(&self, table: &TableSpec, row: Row) {
        let key = RowKey::extract(&row, &table.primary_keys).unwrap().to_string();
        self.tables
            .lock()
            .unwrap()
            .entry(table.qualified_name())
            .or_default()
            .insert(key, row);
    }

    pub fn fail_next_upserts(&self, count: u32) {
        self.transient_upsert_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_all_upserts(&self, fail: bool) {
        *self.fail_all_upserts.lock().unwrap() = fail;
    }

    /// Fail deletes for a key rendered like `(id=7)`.
    pub fn fail_deletes_for(&self, key: &str) {
        self.fail_deletes.lock().unwrap().insert(key.to_string());
    }

    pub fn clear_delete_failures(&self) {
        self.fail_deletes.lock().unwrap().clear();
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TargetStore for FakeTarget {
    async fn upsert_rows(&self, table: &TableSpec, rows: &[Row]) -> Result<u64> {
        self.upsert_attempts.fetch_add(1, Ordering::SeqCst);
        if *self.fail_all_upserts.lock().unwrap() {
            bail!("injected upsert failure");
        }
        let pending = self.transient_upsert_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.transient_upsert_failures
                .store(pending - 1, Ordering::SeqCst);
            bail!("injected transient upsert failure");
        }

        let qualified = table.qualified_name();
        let mut tables = self.tables.lock().unwrap();
        let target = tables.entry(qualified.clone()).or_default();
        for row in rows {
            let key = RowKey::extract(row, &table.primary_keys)
                .ok_or_else(|| anyhow!("row without primary key"))?
                .to_string();
            target.entry(key).or_default().extend(row.clone());
        }
        self.calls.lock().unwrap().push(TargetCall::Upsert {
            table: qualified,
            rows: rows.len(),
        });
        Ok(rows.len() as u64)
    }

    async fn delete_row(&self, table: &TableSpec, key: &RowKey) -> Result<u64> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let rendered = key.to_string();
        if self.fail_deletes.lock().unwrap().contains(&rendered) {
            bail!("injected delete failure for {}", rendered);
        }
        let qualified = table.qualified_name();
        let removed = self
            .tables
            .lock()
            .unwrap()
            .get_mut(&qualified)
            .and_then(|t| t.remove(&rendered))
            .is_some();
        self.calls.lock().unwrap().push(TargetCall::Delete {
            table: qualified,
            key: rendered,
        });
        Ok(u64::from(removed))
    }
}
