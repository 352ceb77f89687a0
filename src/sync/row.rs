// ABOUTME: Row, key and change-event types flowing between source and target
// ABOUTME: Rows stay opaque JSON objects; only primary-key fields are ever inspected

use serde_json::{Map, Value};
use std::sync::Arc;

use crate::registry::TableSpec;

/// A replicated row: column name to JSON value. Business fields are forwarded untouched.
pub type Row = Map<String, Value>;

/// The primary-key tuple of a row, in the table's key-column order.
#[derive(Debug, Clone, PartialEq)]
pub struct RowKey {
    columns: Vec<(String, Value)>,
}

impl RowKey {
    /// Extract the key columns from a row-shaped object.
    ///
    /// Returns `None` when any key column is absent or null, since such a key
    /// cannot address a target row.
    pub fn extract(row: &Row, primary_keys: &[String]) -> Option<Self> {
        if primary_keys.is_empty() {
            return None;
        }
        let mut columns = Vec::with_capacity(primary_keys.len());
        for column in primary_keys {
            match row.get(column) {
                Some(Value::Null) | None => return None,
                Some(value) => columns.push((column.clone(), value.clone())),
            }
        }
        Some(Self { columns })
    }

    /// Like [`RowKey::extract`] but reports which key columns are missing.
    pub fn extract_or_missing(row: &Row, primary_keys: &[String]) -> Result<Self, Vec<String>> {
        Self::extract(row, primary_keys).ok_or_else(|| {
            primary_keys
                .iter()
                .filter(|c| matches!(row.get(*c), None | Some(Value::Null)))
                .cloned()
                .collect()
        })
    }

    pub fn columns(&self) -> &[(String, Value)] {
        &self.columns
    }

    /// The key as a JSON object, e.g. `{"id": 2}`.
    pub fn to_json(&self) -> Value {
        Value::Object(self.columns.iter().cloned().collect())
    }
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .columns
            .iter()
            .map(|(column, value)| format!("{}={}", column, value))
            .collect();
        write!(f, "({})", parts.join(", "))
    }
}

/// Kind of change carried by a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

/// A row-level change with the payload each kind needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Insert(Row),
    Update(Row),
    /// Carries the old row; only its key columns are used.
    Delete(Row),
}

impl Change {
    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::Insert(_) => ChangeKind::Insert,
            Change::Update(_) => ChangeKind::Update,
            Change::Delete(_) => ChangeKind::Delete,
        }
    }

    pub fn row(&self) -> &Row {
        match self {
            Change::Insert(row) | Change::Update(row) | Change::Delete(row) => row,
        }
    }
}

/// Raw notification as published by the source: `{eventType, new?, old?}`.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct RawChange {
    #[serde(rename = "eventType", alias = "type")]
    pub event_type: String,
    #[serde(default)]
    pub new: Option<Row>,
    #[serde(default)]
    pub old: Option<Row>,
}

impl RawChange {
    /// Turn a notification into a typed change.
    ///
    /// Inserts and updates need `new`; deletes need `old`. Unknown event types and
    /// missing payloads yield `None`.
    pub fn into_change(self) -> Option<Change> {
        match ChangeKind::parse(&self.event_type)? {
            ChangeKind::Insert => self.new.map(Change::Insert),
            ChangeKind::Update => self.new.map(Change::Update),
            ChangeKind::Delete => self.old.map(Change::Delete),
        }
    }
}

/// One queued realtime event.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: Arc<TableSpec>,
    pub change: Change,
}

impl ChangeEvent {
    pub fn new(table: Arc<TableSpec>, change: Change) -> Self {
        Self { table, change }
    }
}
