// ABOUTME: Worker configuration - JSON table config, env/CLI overrides, run mode
// ABOUTME: Resolves defaults < config file < environment < CLI flags into Settings

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::postgres::ConnectionSpec;
use crate::utils::{validate_postgres_identifier, RetryPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "sync-tables.json";
pub const DEFAULT_STATE_PATH: &str = ".sync-worker/state.json";
pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_INCREMENTAL_FIELDS: [&str; 2] = ["updated_at", "created_at"];
pub const DEFAULT_PRIMARY_KEY: &str = "id";

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_LOOKBACK_MS: u64 = 5 * 60_000;
pub const DEFAULT_INITIAL_BACKFILL_MS: u64 = 24 * 60 * 60_000;
pub const DEFAULT_DELETION_LOG_TABLE: &str = "sync_deletion_log";
pub const DEFAULT_DELETION_LOG_BATCH_SIZE: usize = 500;
pub const DEFAULT_SUBSCRIBE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RESUBSCRIBE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Environment variables holding store credentials. All four are required.
pub const ENV_SOURCE_URL: &str = "SYNC_SOURCE_URL";
pub const ENV_SOURCE_KEY: &str = "SYNC_SOURCE_KEY";
pub const ENV_TARGET_URL: &str = "SYNC_TARGET_URL";
pub const ENV_TARGET_KEY: &str = "SYNC_TARGET_KEY";

/// Errors an operator has to fix before the worker can start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    MissingEnv(Vec<&'static str>),
    #[error("invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

impl ConfigError {
    fn invalid(name: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Per-table settings that can appear in `defaults` or on a table entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableDefaults {
    pub schema: Option<String>,
    pub primary_keys: Option<Vec<String>>,
    pub realtime_enabled: Option<bool>,
    pub reconcile_enabled: Option<bool>,
    pub incremental_fields: Option<Vec<String>>,
}

/// A table entry with its own overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,
    pub schema: Option<String>,
    pub primary_keys: Option<Vec<String>>,
    pub realtime_enabled: Option<bool>,
    pub reconcile_enabled: Option<bool>,
    pub incremental_fields: Option<Vec<String>>,
    /// Notification channel; defaults to `<schema>_<table>_changes`.
    pub channel: Option<String>,
}

/// Either a bare table name (all defaults) or a full entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableEntry {
    Name(String),
    Table(TableConfig),
}

impl TableEntry {
    pub fn into_config(self) -> TableConfig {
        match self {
            TableEntry::Name(name) => TableConfig {
                name,
                schema: None,
                primary_keys: None,
                realtime_enabled: None,
                reconcile_enabled: None,
                incremental_fields: None,
                channel: None,
            },
            TableEntry::Table(config) => config,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReconciliationConfig {
    pub batch_size: Option<usize>,
    pub interval_ms: Option<u64>,
    pub lookback_ms: Option<u64>,
    pub initial_backfill_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DeletionLogConfig {
    pub enabled: Option<bool>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub batch_size: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RealtimeConfig {
    pub subscribe_timeout_ms: Option<u64>,
    pub resubscribe_delay_ms: Option<u64>,
    pub shutdown_grace_ms: Option<u64>,
}

/// The JSON table configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub defaults: TableDefaults,
    #[serde(default)]
    pub tables: Vec<TableEntry>,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub deletion_log: DeletionLogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

impl FileConfig {
    /// Load the config file. A missing or unparsable file is a startup error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read table config {:?}", path))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse table config {:?}", path))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: FileConfig = serde_json::from_str(contents)?;
        Ok(config)
    }
}

/// How the process runs, before realtime/loop switches are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Realtime subscriptions plus the reconciliation loop.
    Default,
    /// One reconciliation cycle, then exit.
    Once,
}

impl SyncMode {
    /// Parse `SYNC_MODE`: `default`, or `reconcile`/`cron`/`once`.
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "default" => Ok(SyncMode::Default),
            "reconcile" | "cron" | "once" => Ok(SyncMode::Once),
            other => Err(ConfigError::invalid(
                "SYNC_MODE",
                format!("'{}' (expected default, reconcile, cron or once)", other),
            )),
        }
    }
}

/// Parse a `true`/`false` style environment flag.
pub fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid(
            name,
            format!("'{}' (expected true or false)", other),
        )),
    }
}

/// Values coming from the environment and the command line.
///
/// Environment variables are read by the CLI parser, so by the time they land here
/// a command-line flag has already replaced its environment counterpart.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--default`
    pub force_default: bool,
    /// `--once`, `--cron` or `--reconcile-only`
    pub once: bool,
    /// `--no-realtime`
    pub no_realtime: bool,
    /// `SYNC_MODE`
    pub mode: Option<String>,
    /// `SYNC_REALTIME`
    pub realtime: Option<String>,
    /// `SYNC_LOOP`
    pub loop_enabled: Option<String>,
    pub interval_ms: Option<u64>,
    pub lookback_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub initial_backfill_ms: Option<u64>,
    pub state_path: Option<PathBuf>,
}

/// Which long-running parts of the worker are switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunMode {
    pub realtime: bool,
    pub loop_enabled: bool,
}

impl RunMode {
    /// Neither realtime nor the loop: run one cycle and exit.
    pub fn is_single_pass(&self) -> bool {
        !self.realtime && !self.loop_enabled
    }

    pub fn resolve(overrides: &Overrides) -> Result<Self, ConfigError> {
        if overrides.force_default {
            return Ok(RunMode {
                realtime: !overrides.no_realtime,
                loop_enabled: true,
            });
        }

        let env_mode = match overrides.mode.as_deref() {
            Some(value) => SyncMode::parse(value)?,
            None => SyncMode::Default,
        };
        let mode = if overrides.once {
            SyncMode::Once
        } else {
            env_mode
        };

        if mode == SyncMode::Once {
            return Ok(RunMode {
                realtime: false,
                loop_enabled: false,
            });
        }

        let realtime = match overrides.realtime.as_deref() {
            Some(value) => parse_flag("SYNC_REALTIME", value)?,
            None => true,
        } && !overrides.no_realtime;
        let loop_enabled = match overrides.loop_enabled.as_deref() {
            Some(value) => parse_flag("SYNC_LOOP", value)?,
            None => true,
        };

        Ok(RunMode {
            realtime,
            loop_enabled,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub batch_size: usize,
    pub interval: Duration,
    pub lookback: Duration,
    pub initial_backfill: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionLogSettings {
    pub enabled: bool,
    pub schema: String,
    pub table: String,
    pub batch_size: usize,
}

impl DeletionLogSettings {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeSettings {
    pub subscribe_timeout: Duration,
    pub resubscribe_delay: Duration,
    pub shutdown_grace: Duration,
}

/// Fully resolved worker settings (everything except the table list).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub run: RunMode,
    pub reconcile: ReconcileSettings,
    pub deletion_log: DeletionLogSettings,
    pub realtime: RealtimeSettings,
    pub retry: RetryPolicy,
    pub state_path: PathBuf,
}

impl Settings {
    pub fn resolve(file: &FileConfig, overrides: &Overrides) -> Result<Self, ConfigError> {
        let run = RunMode::resolve(overrides)?;

        let reconcile = ReconcileSettings {
            batch_size: positive(
                "reconciliation.batchSize",
                overrides
                    .batch_size
                    .or(file.reconciliation.batch_size)
                    .unwrap_or(DEFAULT_BATCH_SIZE) as u64,
            )? as usize,
            interval: millis(
                "reconciliation.intervalMs",
                overrides
                    .interval_ms
                    .or(file.reconciliation.interval_ms)
                    .unwrap_or(DEFAULT_INTERVAL_MS),
            )?,
            lookback: millis(
                "reconciliation.lookbackMs",
                overrides
                    .lookback_ms
                    .or(file.reconciliation.lookback_ms)
                    .unwrap_or(DEFAULT_LOOKBACK_MS),
            )?,
            initial_backfill: millis(
                "reconciliation.initialBackfillMs",
                overrides
                    .initial_backfill_ms
                    .or(file.reconciliation.initial_backfill_ms)
                    .unwrap_or(DEFAULT_INITIAL_BACKFILL_MS),
            )?,
        };

        let deletion_log = DeletionLogSettings {
            enabled: file.deletion_log.enabled.unwrap_or(true),
            schema: identifier(
                "deletionLog.schema",
                file.deletion_log
                    .schema
                    .clone()
                    .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            )?,
            table: identifier(
                "deletionLog.table",
                file.deletion_log
                    .table
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DELETION_LOG_TABLE.to_string()),
            )?,
            batch_size: positive(
                "deletionLog.batchSize",
                file.deletion_log
                    .batch_size
                    .unwrap_or(DEFAULT_DELETION_LOG_BATCH_SIZE) as u64,
            )? as usize,
        };

        let realtime = RealtimeSettings {
            subscribe_timeout: millis(
                "realtime.subscribeTimeoutMs",
                file.realtime
                    .subscribe_timeout_ms
                    .unwrap_or(DEFAULT_SUBSCRIBE_TIMEOUT_MS),
            )?,
            resubscribe_delay: Duration::from_millis(
                file.realtime
                    .resubscribe_delay_ms
                    .unwrap_or(DEFAULT_RESUBSCRIBE_DELAY_MS),
            ),
            shutdown_grace: Duration::from_millis(
                file.realtime
                    .shutdown_grace_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
        };

        let retry = RetryPolicy::new(
            positive(
                "retry.maxAttempts",
                file.retry
                    .max_attempts
                    .unwrap_or(crate::utils::DEFAULT_MAX_ATTEMPTS) as u64,
            )? as u32,
            file.retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(crate::utils::DEFAULT_BASE_DELAY),
        );

        let state_path = overrides
            .state_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_PATH));

        Ok(Settings {
            run,
            reconcile,
            deletion_log,
            realtime,
            retry,
            state_path,
        })
    }
}

fn positive(name: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::invalid(name, "must be greater than zero"));
    }
    Ok(value)
}

fn millis(name: &str, value: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_millis(positive(name, value)?))
}

fn identifier(name: &str, value: String) -> Result<String, ConfigError> {
    validate_postgres_identifier(&value)
        .map_err(|e| ConfigError::invalid(name, e.to_string()))?;
    Ok(value)
}

/// Source and target connection details.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub source: ConnectionSpec,
    pub target: ConnectionSpec,
}

impl Credentials {
    /// Build credentials, listing every missing variable in one error.
    pub fn from_values(
        source_url: Option<String>,
        source_key: Option<String>,
        target_url: Option<String>,
        target_key: Option<String>,
    ) -> Result<Self, ConfigError> {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());

        let missing: Vec<&'static str> = [
            (ENV_SOURCE_URL, present(&source_url)),
            (ENV_SOURCE_KEY, present(&source_key)),
            (ENV_TARGET_URL, present(&target_url)),
            (ENV_TARGET_KEY, present(&target_key)),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect();

        match (source_url, source_key, target_url, target_key) {
            (Some(su), Some(sk), Some(tu), Some(tk)) if missing.is_empty() => Ok(Credentials {
                source: ConnectionSpec::new(su, sk),
                target: ConnectionSpec::new(tu, tk),
            }),
            _ => Err(ConfigError::MissingEnv(missing)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "defaults": { "schema": "app", "incrementalFields": ["modified_at"] },
        "tables": [
            "customers",
            { "name": "orders", "primaryKeys": ["order_id"], "realtimeEnabled": false },
            { "name": "audit", "schema": "ops", "reconcileEnabled": false, "channel": "audit_feed" }
        ],
        "reconciliation": { "batchSize": 250, "intervalMs": 30000, "lookbackMs": 10000, "initialBackfillMs": 3600000 },
        "deletionLog": { "table": "tombstones" }
    }"#;

    #[test]
    fn test_parse_file_config() {
        let config = FileConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.defaults.schema.as_deref(), Some("app"));
        assert_eq!(config.tables.len(), 3);
        assert_eq!(config.tables[0], TableEntry::Name("customers".to_string()));
        match &config.tables[1] {
            TableEntry::Table(t) => {
                assert_eq!(t.name, "orders");
                assert_eq!(t.primary_keys, Some(vec!["order_id".to_string()]));
                assert_eq!(t.realtime_enabled, Some(false));
            }
            other => panic!("unexpected entry {:?}", other),
        }
        assert_eq!(config.reconciliation.batch_size, Some(250));
        assert_eq!(config.deletion_log.table.as_deref(), Some("tombstones"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(FileConfig::parse(r#"{"tables": [], "reconcile": {}}"#).is_err());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::resolve(&FileConfig::default(), &Overrides::default()).unwrap();
        assert_eq!(settings.reconcile.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(settings.reconcile.interval, Duration::from_millis(DEFAULT_INTERVAL_MS));
        assert_eq!(settings.reconcile.lookback, Duration::from_millis(DEFAULT_LOOKBACK_MS));
        assert_eq!(
            settings.reconcile.initial_backfill,
            Duration::from_secs(24 * 60 * 60)
        );
        assert_eq!(settings.deletion_log.qualified_name(), "public.sync_deletion_log");
        assert_eq!(settings.retry, RetryPolicy::default());
        assert_eq!(settings.state_path, PathBuf::from(DEFAULT_STATE_PATH));
        assert_eq!(
            settings.run,
            RunMode {
                realtime: true,
                loop_enabled: true
            }
        );
    }

    #[test]
    fn test_env_overrides_file_values() {
        let file = FileConfig::parse(SAMPLE).unwrap();
        let overrides = Overrides {
            interval_ms: Some(5_000),
            batch_size: Some(10),
            state_path: Some(PathBuf::from("/var/lib/sync/state.json")),
            ..Default::default()
        };
        let settings = Settings::resolve(&file, &overrides).unwrap();
        assert_eq!(settings.reconcile.interval, Duration::from_secs(5));
        assert_eq!(settings.reconcile.batch_size, 10);
        assert_eq!(settings.reconcile.lookback, Duration::from_secs(10));
        assert_eq!(settings.reconcile.initial_backfill, Duration::from_secs(3600));
        assert_eq!(settings.deletion_log.table, "tombstones");
        assert_eq!(settings.state_path, PathBuf::from("/var/lib/sync/state.json"));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let overrides = Overrides {
            batch_size: Some(0),
            ..Default::default()
        };
        let err = Settings::resolve(&FileConfig::default(), &overrides).unwrap_err();
        assert!(err.to_string().contains("reconciliation.batchSize"));
    }

    #[test]
    fn test_sync_mode_parsing() {
        assert_eq!(SyncMode::parse("default").unwrap(), SyncMode::Default);
        assert_eq!(SyncMode::parse("reconcile").unwrap(), SyncMode::Once);
        assert_eq!(SyncMode::parse("CRON").unwrap(), SyncMode::Once);
        assert_eq!(SyncMode::parse("once").unwrap(), SyncMode::Once);
        assert!(SyncMode::parse("sometimes").is_err());
    }

    #[test]
    fn test_run_mode_once_disables_realtime_and_loop() {
        let from_flag = RunMode::resolve(&Overrides {
            once: true,
            ..Default::default()
        })
        .unwrap();
        assert!(from_flag.is_single_pass());

        let from_env = RunMode::resolve(&Overrides {
            mode: Some("cron".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(from_env.is_single_pass());
    }

    #[test]
    fn test_force_default_beats_env_mode() {
        let mode = RunMode::resolve(&Overrides {
            force_default: true,
            mode: Some("once".to_string()),
            loop_enabled: Some("false".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            mode,
            RunMode {
                realtime: true,
                loop_enabled: true
            }
        );
    }

    #[test]
    fn test_realtime_and_loop_switches() {
        let mode = RunMode::resolve(&Overrides {
            realtime: Some("false".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(!mode.realtime);
        assert!(mode.loop_enabled);

        let mode = RunMode::resolve(&Overrides {
            no_realtime: true,
            realtime: Some("true".to_string()),
            loop_enabled: Some("0".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert!(mode.is_single_pass());

        assert!(RunMode::resolve(&Overrides {
            loop_enabled: Some("maybe".to_string()),
            ..Default::default()
        })
        .is_err());
    }

    #[test]
    fn test_missing_credentials_are_listed() {
        let err = Credentials::from_values(
            Some("postgresql://a@src/db".to_string()),
            None,
            Some("   ".to_string()),
            Some("key".to_string()),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required environment variables: SYNC_SOURCE_KEY, SYNC_TARGET_URL"
        );
    }

    #[test]
    fn test_credentials_complete() {
        let creds = Credentials::from_values(
            Some("postgresql://a@src/db".to_string()),
            Some("k1".to_string()),
            Some("postgresql://b@dst/db".to_string()),
            Some("k2".to_string()),
        )
        .unwrap();
        assert_eq!(creds.source.display_url(), "postgresql://a@src/db");
    }
}
