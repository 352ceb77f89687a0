// ABOUTME: Source connector - probes, ordered range reads, deletion log, change subscriptions
// ABOUTME: SourceStore trait plus the PostgreSQL implementation (row_to_json reads, LISTEN/NOTIFY)

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::AsyncMessage;

use super::row::{RawChange, Row};
use super::tombstones::DeletionLogEntry;
use crate::config::DeletionLogSettings;
use crate::postgres::{make_tls_connector, ConnectionSpec, ManagedClient};
use crate::registry::TableSpec;
use crate::utils::{quote_ident, quote_relation, RetryPolicy};

/// Outcome of probing a table (and optionally a cursor column) on the source.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    /// The table itself does not exist; the table is deactivated for good.
    #[error("table {0} does not exist")]
    MissingTable(String),
    /// The table exists but the probed read failed (unknown column, wrong type, ...).
    #[error("{0:#}")]
    Unusable(anyhow::Error),
}

/// Lifecycle of one change subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Item delivered by a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(RawChange),
}

/// An open change subscription for one table.
///
/// Dropping the subscription (or calling [`Subscription::unsubscribe`]) tears down
/// the underlying channel.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(messages: mpsc::UnboundedReceiver<ChannelMessage>, task: Option<JoinHandle<()>>) -> Self {
        Self { messages, task }
    }

    /// Next status change or notification; `None` once the channel is gone.
    pub async fn next(&mut self) -> Option<ChannelMessage> {
        self.messages.recv().await
    }

    /// Best-effort teardown.
    pub fn unsubscribe(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.messages.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Read side of replication.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Bounded read against the table, filtered and ordered by `field` when given.
    async fn probe(&self, table: &TableSpec, field: Option<&str>) -> Result<(), ProbeError>;

    /// Rows with `field >= since`, ascending by `field` then primary key.
    async fn fetch_since(
        &self,
        table: &TableSpec,
        field: &str,
        since: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Row>>;

    /// All rows in primary-key order.
    async fn fetch_ordered(&self, table: &TableSpec, offset: usize, limit: usize) -> Result<Vec<Row>>;

    /// Unprocessed deletion-log entries with `id > after_id`, ascending by id.
    async fn fetch_deletion_log(&self, after_id: i64, limit: usize) -> Result<Vec<DeletionLogEntry>>;

    /// Set `processed_at` on the given entries in a single write.
    async fn mark_deletions_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> Result<()>;

    /// Open a change subscription for the table.
    async fn subscribe(&self, table: &TableSpec) -> Result<Subscription>;
}

/// PostgreSQL source.
///
/// Reads go through one shared client, reopened after the connection drops; each
/// subscription opens its own connection so a broken channel never affects
/// reconciliation reads.
pub struct PgSource {
    client: ManagedClient,
    deletion_log: DeletionLogSettings,
    subscribe_timeout: Duration,
}

impl PgSource {
    pub async fn connect(
        spec: ConnectionSpec,
        deletion_log: DeletionLogSettings,
        subscribe_timeout: Duration,
        retry: &RetryPolicy,
    ) -> Result<Self> {
        let client = ManagedClient::connect(spec, retry)
            .await
            .context("Failed to connect to source database")?;
        Ok(Self {
            client,
            deletion_log,
            subscribe_timeout,
        })
    }
}

#[async_trait]
impl SourceStore for PgSource {
    async fn probe(&self, table: &TableSpec, field: Option<&str>) -> Result<(), ProbeError> {
        let client = self.client.get().await.map_err(ProbeError::Unusable)?;
        let result = match field {
            Some(field) => {
                let since = Utc::now();
                client
                    .query(&build_probe_query(table, Some(field)), &[&since])
                    .await
            }
            None => client.query(&build_probe_query(table, None), &[]).await,
        };

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_missing_relation(&e) => Err(ProbeError::MissingTable(table.qualified_name())),
            Err(e) => Err(ProbeError::Unusable(anyhow::Error::new(e).context(format!(
                "probe of {} failed",
                table.qualified_name()
            )))),
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
        let query = build_incremental_query(table, field);
        let rows = self
            .client
            .get()
            .await?
            .query(&query, &[&since, &(limit as i64), &(offset as i64)])
            .await
            .with_context(|| {
                format!(
                    "Failed to read {} rows with {} >= {} (offset {})",
                    table.qualified_name(),
                    field,
                    since,
                    offset
                )
            })?;
        rows.iter().map(|row| json_row(row.get(0))).collect()
    }

    async fn fetch_ordered(&self, table: &TableSpec, offset: usize, limit: usize) -> Result<Vec<Row>> {
        let query = build_full_scan_query(table);
        let rows = self
            .client
            .get()
            .await?
            .query(&query, &[&(limit as i64), &(offset as i64)])
            .await
            .with_context(|| {
                format!(
                    "Failed to read {} rows in key order (offset {})",
                    table.qualified_name(),
                    offset
                )
            })?;
        rows.iter().map(|row| json_row(row.get(0))).collect()
    }

    async fn fetch_deletion_log(&self, after_id: i64, limit: usize) -> Result<Vec<DeletionLogEntry>> {
        let query = format!(
            "SELECT id, table_name, payload::jsonb FROM {} \
             WHERE processed_at IS NULL AND id > $1 \
             ORDER BY id ASC \
             LIMIT $2",
            quote_relation(&self.deletion_log.schema, &self.deletion_log.table)
        );
        let rows = self
            .client
            .get()
            .await?
            .query(&query, &[&after_id, &(limit as i64)])
            .await
            .with_context(|| {
                format!(
                    "Failed to read deletion log {}",
                    self.deletion_log.qualified_name()
                )
            })?;

        rows.iter()
            .map(|row| {
                Ok(DeletionLogEntry {
                    id: row.try_get(0)?,
                    table_name: row.try_get(1)?,
                    payload: row.try_get::<_, Option<Value>>(2)?.unwrap_or(Value::Null),
                    processed_at: None,
                })
            })
            .collect()
    }

    async fn mark_deletions_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let query = format!(
            "UPDATE {} SET processed_at = $1 WHERE id = ANY($2)",
            quote_relation(&self.deletion_log.schema, &self.deletion_log.table)
        );
        let ids = ids.to_vec();
        self.client
            .get()
            .await?
            .execute(&query, &[&processed_at, &ids])
            .await
            .with_context(|| {
                format!(
                    "Failed to mark {} deletion log entries processed",
                    ids.len()
                )
            })?;
        Ok(())
    }

    async fn subscribe(&self, table: &TableSpec) -> Result<Subscription> {
        let config = self.client.connector().config()?;
        let tls = make_tls_connector()?;
        let listen = format!("LISTEN {}", quote_ident(&table.channel));
        let name = table.qualified_name();
        let subscribe_timeout = self.subscribe_timeout;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let _ = tx.send(ChannelMessage::Status(ChannelStatus::Connecting));

            let (client, mut connection) = match config.connect(tls).await {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::ChannelError(
                        e.to_string(),
                    )));
                    return;
                }
            };

            // The connection must be polled for LISTEN to complete, so drive it
            // before issuing the command.
            let (note_tx, mut note_rx) = mpsc::unbounded_channel();
            let driver = tokio::spawn(async move {
                let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
                futures::pin_mut!(messages);
                while let Some(message) = messages.next().await {
                    match message {
                        Ok(AsyncMessage::Notification(note)) => {
                            if note_tx.send(Ok(note.payload().to_string())).is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            let _ = note_tx.send(Err(e.to_string()));
                            return;
                        }
                    }
                }
            });

            match tokio::time::timeout(subscribe_timeout, client.batch_execute(&listen)).await {
                Err(_) => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::TimedOut));
                    driver.abort();
                    return;
                }
                Ok(Err(e)) => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::ChannelError(
                        e.to_string(),
                    )));
                    driver.abort();
                    return;
                }
                Ok(Ok(())) => {
                    let _ = tx.send(ChannelMessage::Status(ChannelStatus::Subscribed));
                }
            }

            while let Some(item) = note_rx.recv().await {
                match item {
                    Ok(payload) => match serde_json::from_str::<RawChange>(&payload) {
                        Ok(change) => {
                            if tx.send(ChannelMessage::Change(change)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("{}: ignoring malformed change notification: {}", name, e);
                        }
                    },
                    Err(e) => {
                        let _ = tx.send(ChannelMessage::Status(ChannelStatus::ChannelError(e)));
                        driver.abort();
                        return;
                    }
                }
            }

            let _ = tx.send(ChannelMessage::Status(ChannelStatus::Closed));
            drop(client);
        });

        Ok(Subscription::new(rx, Some(task)))
    }
}

fn is_missing_relation(error: &tokio_postgres::Error) -> bool {
    matches!(
        error.code(),
        Some(code) if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::INVALID_SCHEMA_NAME
    )
}

fn json_row(value: Value) -> Result<Row> {
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("Expected a JSON object row, got {}", other),
    }
}

fn order_by_keys(table: &TableSpec) -> String {
    table
        .primary_keys
        .iter()
        .map(|c| format!("t.{} ASC", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Trivial bounded read used to test a table and cursor column.
fn build_probe_query(table: &TableSpec, field: Option<&str>) -> String {
    let relation = quote_relation(&table.schema, &table.name);
    match field {
        Some(field) => format!(
            "SELECT 1 FROM {} t WHERE t.{} >= $1::timestamptz ORDER BY t.{} ASC LIMIT 1",
            relation,
            quote_ident(field),
            quote_ident(field)
        ),
        None => format!("SELECT 1 FROM {} t LIMIT 1", relation),
    }
}

/// Page of rows with `field >= $1`, ordered by the field with primary keys as tiebreaker.
///
/// ```sql
/// SELECT row_to_json(t) FROM "public"."orders" t
/// WHERE t."updated_at" >= $1::timestamptz
/// ORDER BY t."updated_at" ASC, t."id" ASC
/// LIMIT $2 OFFSET $3
/// ```
fn build_incremental_query(table: &TableSpec, field: &str) -> String {
    format!(
        "SELECT row_to_json(t) FROM {} t \
         WHERE t.{} >= $1::timestamptz \
         ORDER BY t.{} ASC, {} \
         LIMIT $2 OFFSET $3",
        quote_relation(&table.schema, &table.name),
        quote_ident(field),
        quote_ident(field),
        order_by_keys(table)
    )
}

/// Page of rows in primary-key order.
fn build_full_scan_query(table: &TableSpec) -> String {
    format!(
        "SELECT row_to_json(t) FROM {} t ORDER BY {} LIMIT $1 OFFSET $2",
        quote_relation(&table.schema, &table.name),
        order_by_keys(table)
    )
}
