// ABOUTME: Target connector - idempotent upserts and key-addressed deletes
// ABOUTME: TargetStore trait plus the PostgreSQL implementation built on json_populate_recordset

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::row::{Row, RowKey};
use crate::postgres::{ConnectionSpec, ManagedClient};
use crate::registry::TableSpec;
use crate::utils::{quote_ident, quote_relation, RetryPolicy};

/// Write side of replication.
///
/// Both operations are idempotent: replaying an upsert converges to the same row and
/// deleting an absent key succeeds.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Insert-or-replace `rows` by primary key. Returns the number of rows written.
    async fn upsert_rows(&self, table: &TableSpec, rows: &[Row]) -> Result<u64>;

    /// Delete the row addressed by `key`. Returns the number of rows removed (0 if absent).
    async fn delete_row(&self, table: &TableSpec, key: &RowKey) -> Result<u64>;
}

/// PostgreSQL target. The client is reopened after its connection drops.
pub struct PgTarget {
    client: ManagedClient,
}

impl PgTarget {
    pub async fn connect(spec: &ConnectionSpec, retry: &RetryPolicy) -> Result<Self> {
        let client = ManagedClient::connect(spec.clone(), retry)
            .await
            .context("Failed to connect to target database")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TargetStore for PgTarget {
    async fn upsert_rows(&self, table: &TableSpec, rows: &[Row]) -> Result<u64> {
        let client = self.client.get().await?;
        let mut total = 0u64;
        for (columns, group) in group_by_columns(rows) {
            let query = build_upsert_query(table, &columns);
            let payload = Value::Array(group.into_iter().cloned().map(Value::Object).collect());
            total += client
                .execute(&query, &[&payload])
                .await
                .with_context(|| format!("Failed to upsert rows into {}", table.qualified_name()))?;
        }
        Ok(total)
    }

    async fn delete_row(&self, table: &TableSpec, key: &RowKey) -> Result<u64> {
        let query = build_delete_query(table);
        let affected = self
            .client
            .get()
            .await?
            .execute(&query, &[&key.to_json()])
            .await
            .with_context(|| {
                format!("Failed to delete {} from {}", key, table.qualified_name())
            })?;
        Ok(affected)
    }
}

/// Split rows into groups sharing the same column set, keeping first-seen order.
///
/// Rows from one page normally share a shape, but notifications and hand-written
/// rows may not, and a single INSERT needs a single column list.
fn group_by_columns(rows: &[Row]) -> Vec<(Vec<String>, Vec<&Row>)> {
    let mut groups: Vec<(Vec<String>, Vec<&Row>)> = Vec::new();
    for row in rows {
        let columns: Vec<String> = row.keys().cloned().collect();
        match groups.iter_mut().find(|(c, _)| *c == columns) {
            Some((_, group)) => group.push(row),
            None => groups.push((columns, vec![row])),
        }
    }
    groups
}

/// Upsert for a JSON array of rows with the given columns.
///
/// ```sql
/// INSERT INTO "public"."orders" ("id", "status")
/// SELECT "id", "status" FROM json_populate_recordset(NULL::"public"."orders", $1::json)
/// ON CONFLICT ("id") DO UPDATE SET "status" = EXCLUDED."status"
/// ```
///
/// `json_populate_recordset` converts each JSON value to the column's declared type,
/// so rows never need per-type parameter binding.
fn build_upsert_query(table: &TableSpec, columns: &[String]) -> String {
    let relation = quote_relation(&table.schema, &table.name);
    let quoted_columns: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_keys: Vec<String> = table.primary_keys.iter().map(|c| quote_ident(c)).collect();

    let update_columns: Vec<String> = columns
        .iter()
        .filter(|c| !table.primary_keys.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let conflict_action = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {relation} ({cols}) \
         SELECT {cols} FROM json_populate_recordset(NULL::{relation}, $1::json) \
         ON CONFLICT ({keys}) {action}",
        relation = relation,
        cols = quoted_columns.join(", "),
        keys = quoted_keys.join(", "),
        action = conflict_action
    )
}

/// Delete by a JSON object holding the key columns.
///
/// ```sql
/// DELETE FROM "public"."items" t
/// USING json_populate_record(NULL::"public"."items", $1::json) k
/// WHERE t."order_id" = k."order_id" AND t."line" = k."line"
/// ```
fn build_delete_query(table: &TableSpec) -> String {
    let relation = quote_relation(&table.schema, &table.name);
    let predicate: Vec<String> = table
        .primary_keys
        .iter()
        .map(|c| format!("t.{col} = k.{col}", col = quote_ident(c)))
        .collect();

    format!(
        "DELETE FROM {relation} t \
         USING json_populate_record(NULL::{relation}, $1::json) k \
         WHERE {predicate}",
        relation = relation,
        predicate = predicate.join(" AND ")
    )
}
