// ABOUTME: Table registry - per-table replication specs merged from config defaults
// ABOUTME: Probes the source once per table to pick incremental, full-scan, or inactive mode

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::config::{
    TableConfig, TableDefaults, TableEntry, DEFAULT_INCREMENTAL_FIELDS, DEFAULT_PRIMARY_KEY,
    DEFAULT_SCHEMA,
};
use crate::sync::source::{ProbeError, SourceStore};
use crate::utils::validate_postgres_identifier;

/// How a table is replicated, decided once at startup by probing the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Not probed yet.
    Unresolved,
    /// Reconciled by scanning rows with `field >= since`.
    Incremental { field: String },
    /// Reconciled by paging through the whole table in primary-key order.
    FullScan,
    /// Reconciliation disabled in config; realtime only.
    RealtimeOnly,
    /// Skipped for the lifetime of the process.
    Inactive { reason: String },
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Unresolved => write!(f, "unresolved"),
            ReplicationMode::Incremental { field } => write!(f, "incremental on {}", field),
            ReplicationMode::FullScan => write!(f, "full scan"),
            ReplicationMode::RealtimeOnly => write!(f, "realtime only"),
            ReplicationMode::Inactive { reason } => write!(f, "inactive ({})", reason),
        }
    }
}

/// Replication settings for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub name: String,
    pub schema: String,
    pub primary_keys: Vec<String>,
    pub realtime_enabled: bool,
    pub reconcile_enabled: bool,
    /// Candidate cursor columns, tried in order.
    pub incremental_fields: Vec<String>,
    /// Notification channel carrying this table's change events.
    pub channel: String,
    pub mode: ReplicationMode,
}

impl TableSpec {
    /// Merge a table entry with the configured defaults and validate identifiers.
    pub fn from_config(config: TableConfig, defaults: &TableDefaults) -> Result<Self> {
        let schema = config
            .schema
            .or_else(|| defaults.schema.clone())
            .unwrap_or_else(|| DEFAULT_SCHEMA.to_string());
        let primary_keys = config
            .primary_keys
            .or_else(|| defaults.primary_keys.clone())
            .unwrap_or_else(|| vec![DEFAULT_PRIMARY_KEY.to_string()]);
        let incremental_fields = config
            .incremental_fields
            .or_else(|| defaults.incremental_fields.clone())
            .unwrap_or_else(|| {
                DEFAULT_INCREMENTAL_FIELDS
                    .iter()
                    .map(|f| f.to_string())
                    .collect()
            });
        let channel = config
            .channel
            .unwrap_or_else(|| format!("{}_{}_changes", schema, config.name));

        let qualified = format!("{}.{}", schema, config.name);
        validate_postgres_identifier(&config.name)
            .with_context(|| format!("Invalid table name in config: {}", qualified))?;
        validate_postgres_identifier(&schema)
            .with_context(|| format!("Invalid schema for table {}", qualified))?;
        validate_postgres_identifier(&channel)
            .with_context(|| format!("Invalid notification channel for table {}", qualified))?;
        if primary_keys.is_empty() {
            bail!("Table {} must declare at least one primary key", qualified);
        }
        for column in primary_keys.iter().chain(incremental_fields.iter()) {
            validate_postgres_identifier(column)
                .with_context(|| format!("Invalid column name for table {}", qualified))?;
        }

        Ok(Self {
            name: config.name,
            schema,
            primary_keys,
            realtime_enabled: config
                .realtime_enabled
                .or(defaults.realtime_enabled)
                .unwrap_or(true),
            reconcile_enabled: config
                .reconcile_enabled
                .or(defaults.reconcile_enabled)
                .unwrap_or(true),
            incremental_fields,
            channel,
            mode: ReplicationMode::Unresolved,
        })
    }

    /// `schema.table`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// Key used in the cursor state file: `schema:table`.
    pub fn state_key(&self) -> String {
        format!("{}:{}", self.schema, self.name)
    }

    pub fn is_active(&self) -> bool {
        !matches!(
            self.mode,
            ReplicationMode::Inactive { .. } | ReplicationMode::Unresolved
        )
    }

    /// The probed cursor column, if reconciliation is incremental.
    pub fn incremental_field(&self) -> Option<&str> {
        match &self.mode {
            ReplicationMode::Incremental { field } => Some(field),
            _ => None,
        }
    }

    pub fn should_reconcile(&self) -> bool {
        self.reconcile_enabled
            && matches!(
                self.mode,
                ReplicationMode::Incremental { .. } | ReplicationMode::FullScan
            )
    }

    pub fn should_subscribe(&self) -> bool {
        self.realtime_enabled && self.is_active()
    }

    /// Whether a deletion-log `table_name` refers to this table.
    pub fn matches_name(&self, name: &str) -> bool {
        let name = name.trim();
        match name.split_once('.') {
            Some((schema, table)) => schema == self.schema && table == self.name,
            None => name == self.name,
        }
    }
}

/// All configured tables with their resolved modes.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: Vec<Arc<TableSpec>>,
}

impl TableRegistry {
    /// Build unresolved specs from config entries. Duplicate tables are rejected.
    pub fn from_config(entries: Vec<TableEntry>, defaults: &TableDefaults) -> Result<Vec<TableSpec>> {
        let mut specs: Vec<TableSpec> = Vec::with_capacity(entries.len());
        for entry in entries {
            let spec = TableSpec::from_config(entry.into_config(), defaults)?;
            if specs
                .iter()
                .any(|s| s.schema == spec.schema && s.name == spec.name)
            {
                bail!("Table {} is configured more than once", spec.qualified_name());
            }
            specs.push(spec);
        }
        Ok(specs)
    }

    /// Wrap specs that already carry a mode (used when probing is done elsewhere).
    pub fn new(tables: Vec<TableSpec>) -> Self {
        Self {
            tables: tables.into_iter().map(Arc::new).collect(),
        }
    }

    /// Probe the source for every table and fix its mode for the process lifetime.
    pub async fn resolve(specs: Vec<TableSpec>, source: &dyn SourceStore) -> Self {
        let mut tables = Vec::with_capacity(specs.len());
        for mut spec in specs {
            spec.mode = resolve_mode(&spec, source).await;
            match &spec.mode {
                ReplicationMode::Inactive { .. } => {
                    tracing::warn!("{}: {}, replication skipped", spec.qualified_name(), spec.mode)
                }
                ReplicationMode::FullScan => tracing::warn!(
                    "{}: no usable incremental field among [{}], falling back to full scan",
                    spec.qualified_name(),
                    spec.incremental_fields.join(", ")
                ),
                mode => tracing::info!(
                    "{}: {} (realtime {})",
                    spec.qualified_name(),
                    mode,
                    if spec.realtime_enabled { "on" } else { "off" }
                ),
            }
            tables.push(Arc::new(spec));
        }
        Self { tables }
    }

    pub fn tables(&self) -> &[Arc<TableSpec>] {
        &self.tables
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn realtime_tables(&self) -> impl Iterator<Item = &Arc<TableSpec>> {
        self.tables.iter().filter(|t| t.should_subscribe())
    }

    pub fn reconcile_tables(&self) -> impl Iterator<Item = &Arc<TableSpec>> {
        self.tables.iter().filter(|t| t.should_reconcile())
    }

    /// Find a configured table by `table` or `schema.table`.
    ///
    /// A bare name matching tables in several schemas resolves to the first configured.
    pub fn find(&self, name: &str) -> Option<&Arc<TableSpec>> {
        self.tables.iter().find(|t| t.matches_name(name))
    }
}

async fn resolve_mode(spec: &TableSpec, source: &dyn SourceStore) -> ReplicationMode {
    if spec.reconcile_enabled {
        for field in &spec.incremental_fields {
            match source.probe(spec, Some(field)).await {
                Ok(()) => {
                    return ReplicationMode::Incremental {
                        field: field.clone(),
                    }
                }
                Err(ProbeError::MissingTable(_)) => {
                    return ReplicationMode::Inactive {
                        reason: "table does not exist in source".to_string(),
                    }
                }
                Err(e) => {
                    tracing::debug!(
                        "{}: incremental field {} unusable: {}",
                        spec.qualified_name(),
                        field,
                        e
                    );
                }
            }
        }
    }

    match source.probe(spec, None).await {
        Ok(()) if spec.reconcile_enabled => ReplicationMode::FullScan,
        Ok(()) if spec.realtime_enabled => ReplicationMode::RealtimeOnly,
        Ok(()) => ReplicationMode::Inactive {
            reason: "realtime and reconciliation both disabled".to_string(),
        },
        Err(ProbeError::MissingTable(_)) => ReplicationMode::Inactive {
            reason: "table does not exist in source".to_string(),
        },
        Err(e) => ReplicationMode::Inactive {
            reason: format!("source probe failed: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(json: &str) -> TableEntry {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_bare_name_gets_builtin_defaults() {
        let spec = TableSpec::from_config(
            entry(r#""orders""#).into_config(),
            &TableDefaults::default(),
        )
        .unwrap();
        assert_eq!(spec.schema, "public");
        assert_eq!(spec.primary_keys, vec!["id"]);
        assert!(spec.realtime_enabled);
        assert!(spec.reconcile_enabled);
        assert_eq!(spec.incremental_fields, vec!["updated_at", "created_at"]);
        assert_eq!(spec.channel, "public_orders_changes");
        assert_eq!(spec.mode, ReplicationMode::Unresolved);
        assert_eq!(spec.qualified_name(), "public.orders");
        assert_eq!(spec.state_key(), "public:orders");
    }

    #[test]
    fn test_entry_overrides_defaults() {
        let defaults = TableDefaults {
            schema: Some("app".to_string()),
            realtime_enabled: Some(false),
            incremental_fields: Some(vec!["modified_at".to_string()]),
            ..Default::default()
        };
        let spec = TableSpec::from_config(
            entry(r#"{"name": "items", "primaryKeys": ["order_id", "line"], "realtimeEnabled": true}"#)
                .into_config(),
            &defaults,
        )
        .unwrap();
        assert_eq!(spec.schema, "app");
        assert_eq!(spec.primary_keys, vec!["order_id", "line"]);
        assert!(spec.realtime_enabled);
        assert_eq!(spec.incremental_fields, vec!["modified_at"]);
    }

    #[test]
    fn test_invalid_identifiers_are_rejected() {
        let defaults = TableDefaults::default();
        assert!(TableSpec::from_config(entry(r#""bad-name""#).into_config(), &defaults).is_err());
        assert!(TableSpec::from_config(
            entry(r#"{"name": "t", "primaryKeys": []}"#).into_config(),
            &defaults
        )
        .is_err());
        assert!(TableSpec::from_config(
            entry(r#"{"name": "t", "incrementalFields": ["x; drop"]}"#).into_config(),
            &defaults
        )
        .is_err());
    }

    #[test]
    fn test_duplicate_tables_are_rejected() {
        let entries = vec![entry(r#""orders""#), entry(r#"{"name": "orders", "schema": "public"}"#)];
        assert!(TableRegistry::from_config(entries, &TableDefaults::default()).is_err());
    }

    #[test]
    fn test_find_by_bare_and_qualified_name() {
        let mut orders = TableSpec::from_config(
            entry(r#""orders""#).into_config(),
            &TableDefaults::default(),
        )
        .unwrap();
        orders.mode = ReplicationMode::FullScan;
        let mut audit = TableSpec::from_config(
            entry(r#"{"name": "audit", "schema": "ops"}"#).into_config(),
            &TableDefaults::default(),
        )
        .unwrap();
        audit.mode = ReplicationMode::RealtimeOnly;
        let registry = TableRegistry::new(vec![orders, audit]);

        assert_eq!(registry.find("orders").unwrap().name, "orders");
        assert_eq!(registry.find("public.orders").unwrap().name, "orders");
        assert_eq!(registry.find("ops.audit").unwrap().name, "audit");
        assert!(registry.find("public.audit").is_none());
        assert!(registry.find("missing").is_none());

        assert_eq!(registry.reconcile_tables().count(), 1);
        assert_eq!(registry.realtime_tables().count(), 2);
    }

    #[test]
    fn test_mode_accessors() {
        let mut spec = TableSpec::from_config(
            entry(r#""orders""#).into_config(),
            &TableDefaults::default(),
        )
        .unwrap();
        assert!(!spec.is_active());

        spec.mode = ReplicationMode::Incremental {
            field: "updated_at".to_string(),
        };
        assert!(spec.is_active());
        assert!(spec.should_reconcile());
        assert_eq!(spec.incremental_field(), Some("updated_at"));

        spec.mode = ReplicationMode::Inactive {
            reason: "gone".to_string(),
        };
        assert!(!spec.should_reconcile());
        assert!(!spec.should_subscribe());
    }
}
