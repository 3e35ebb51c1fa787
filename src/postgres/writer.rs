// ABOUTME: Target session for PostgreSQL - applies one change set per transaction
// ABOUTME: Uses INSERT ... ON CONFLICT DO UPDATE for upserts and batched deletes by key or ctid

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

use super::reader::{self, qualified, typed_placeholder, MAX_BIND_PARAMS};
use crate::config::DeletePolicy;
use crate::sync::{
    ApplyOutcome, ChangeApplier, ChangeSet, ColumnInfo, PrimaryKey, RowIdentity, ScanRange,
    ScannedRow, ScannedRows, TableDescriptor, TableReader,
};
use crate::utils::quote_ident;

const DELETE_SAVEPOINT: &str = "sync_delete";

/// One worker's connection to the target database.
///
/// The client sits behind a mutex because a transaction needs `&mut Client`
/// while the session is shared as `&self` through the traits.
pub struct PgTargetSession {
    client: Mutex<Client>,
}

impl PgTargetSession {
    pub fn new(client: Client) -> Self {
        Self {
            client: Mutex::new(client),
        }
    }
}

#[async_trait]
impl TableReader for PgTargetSession {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        let client = self.client.lock().await;
        reader::list_tables(&client, schema).await
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let client = self.client.lock().await;
        reader::list_columns(&client, schema, table).await
    }

    async fn primary_key(&self, schema: &str, table: &str) -> Result<PrimaryKey> {
        let client = self.client.lock().await;
        reader::primary_key(&client, schema, table).await
    }

    async fn key_bounds(&self, table: &TableDescriptor) -> Result<Option<(i64, i64)>> {
        let client = self.client.lock().await;
        reader::key_bounds(&client, table).await
    }

    async fn scan(&self, table: &TableDescriptor, range: &ScanRange) -> Result<ScannedRows> {
        let client = self.client.lock().await;
        reader::scan(&client, table, range).await
    }
}

#[async_trait]
impl ChangeApplier for PgTargetSession {
    async fn apply_changes(
        &self,
        table: &TableDescriptor,
        changes: &ChangeSet,
        source: &ScannedRows,
        target: &ScannedRows,
        policy: DeletePolicy,
    ) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();
        if changes.is_empty() {
            return Ok(outcome);
        }

        let upsert_rows = changes
            .upserts()
            .map(|key| {
                source
                    .get(key)
                    .ok_or_else(|| anyhow!("{}: no source row for key {}", table.qualified_name(), key))
            })
            .collect::<Result<Vec<&ScannedRow>>>()?;
        let deletes = delete_params(table, changes, target)?;

        let mut client = self.client.lock().await;
        let mut tx = client
            .transaction()
            .await
            .context("Failed to begin target transaction")?;

        let deleted = if deletes_before_upserts(&table.identity) {
            let deleted = delete_with_policy(&mut tx, table, &deletes, policy).await?;
            outcome.upserted = upsert_rows_in(&tx, table, &upsert_rows).await?;
            deleted
        } else {
            outcome.upserted = upsert_rows_in(&tx, table, &upsert_rows).await?;
            delete_with_policy(&mut tx, table, &deletes, policy).await?
        };
        match deleted {
            Some(count) => outcome.deleted = count,
            None => outcome.delete_skipped = true,
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit changes to {}", table.qualified_name()))?;

        Ok(outcome)
    }

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()> {
        let query = format!(
            "DROP TABLE IF EXISTS {}.{} CASCADE",
            quote_ident(schema),
            quote_ident(table)
        );
        let client = self.client.lock().await;
        client
            .batch_execute(&query)
            .await
            .with_context(|| format!("Failed to drop table {}.{}", schema, table))
    }
}

/// What a delete statement needs: key parts for keyed tables, `ctid`
/// locators for keyless ones.
enum DeleteParams {
    Keys(Vec<Vec<String>>),
    Locators(Vec<String>),
}

impl DeleteParams {
    fn is_empty(&self) -> bool {
        match self {
            DeleteParams::Keys(keys) => keys.is_empty(),
            DeleteParams::Locators(locators) => locators.is_empty(),
        }
    }

    fn len(&self) -> usize {
        match self {
            DeleteParams::Keys(keys) => keys.len(),
            DeleteParams::Locators(locators) => locators.len(),
        }
    }
}

fn delete_params(
    table: &TableDescriptor,
    changes: &ChangeSet,
    target: &ScannedRows,
) -> Result<DeleteParams> {
    match &table.identity {
        RowIdentity::PrimaryKey(_) => Ok(DeleteParams::Keys(
            changes.delete.iter().map(|key| key.parts().to_vec()).collect(),
        )),
        RowIdentity::WholeRow => changes
            .delete
            .iter()
            .map(|key| {
                target
                    .get(key)
                    .and_then(|row| row.locator.clone())
                    .ok_or_else(|| {
                        anyhow!(
                            "{}: no row locator for surplus row {}",
                            table.qualified_name(),
                            key
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()
            .map(DeleteParams::Locators),
    }
}

/// Rows per statement so no statement exceeds [`MAX_BIND_PARAMS`].
fn rows_per_statement(params_per_row: usize) -> usize {
    std::cmp::max(1, MAX_BIND_PARAMS / params_per_row.max(1))
}

/// Keyless tables identify rows by content, so a changed row is a delete of the
/// old copy plus an insert of the new one and the delete has to run first.
fn deletes_before_upserts(identity: &RowIdentity) -> bool {
    matches!(identity, RowIdentity::WholeRow)
}

/// Runs the chunk's deletes under `policy`. Returns `None` when a best-effort
/// delete failed and was rolled back to its savepoint.
async fn delete_with_policy(
    tx: &mut Transaction<'_>,
    table: &TableDescriptor,
    deletes: &DeleteParams,
    policy: DeletePolicy,
) -> Result<Option<u64>> {
    if deletes.is_empty() {
        return Ok(Some(0));
    }

    match policy {
        DeletePolicy::Atomic => Ok(Some(delete_rows_in(tx, table, deletes).await?)),
        DeletePolicy::BestEffort => {
            let savepoint = tx
                .savepoint(DELETE_SAVEPOINT)
                .await
                .context("Failed to create delete savepoint")?;
            match delete_rows_in(&savepoint, table, deletes).await {
                Ok(deleted) => {
                    savepoint
                        .commit()
                        .await
                        .context("Failed to release delete savepoint")?;
                    Ok(Some(deleted))
                }
                Err(e) => {
                    tracing::warn!(
                        "Delete of {} rows from {} failed, keeping the other changes: {:#}",
                        deletes.len(),
                        table.qualified_name(),
                        e
                    );
                    savepoint
                        .rollback()
                        .await
                        .context("Failed to roll back delete savepoint")?;
                    Ok(None)
                }
            }
        }
    }
}

async fn upsert_rows_in(
    tx: &Transaction<'_>,
    table: &TableDescriptor,
    rows: &[&ScannedRow],
) -> Result<u64> {
    let mut affected = 0u64;

    for batch in rows.chunks(rows_per_statement(table.columns.len())) {
        let query = match &table.identity {
            RowIdentity::PrimaryKey(keys) => build_upsert_query(table, keys, batch.len()),
            RowIdentity::WholeRow => build_insert_query(table, batch.len()),
        };
        let params: Vec<&(dyn ToSql + Sync)> = batch
            .iter()
            .flat_map(|row| row.values.iter().map(|v| v as &(dyn ToSql + Sync)))
            .collect();

        affected += tx
            .execute(&query, &params)
            .await
            .with_context(|| format!("Failed to upsert batch into {}", table.qualified_name()))?;
    }

    Ok(affected)
}

async fn delete_rows_in(
    tx: &Transaction<'_>,
    table: &TableDescriptor,
    deletes: &DeleteParams,
) -> Result<u64> {
    match deletes {
        DeleteParams::Locators(locators) => {
            let query = build_locator_delete_query(table);
            tx.execute(&query, &[locators])
                .await
                .with_context(|| format!("Failed to delete rows from {}", table.qualified_name()))
        }
        DeleteParams::Keys(keys) => {
            let key_count = table.key_indexes().len();
            let mut deleted = 0u64;

            for batch in keys.chunks(rows_per_statement(key_count)) {
                let query = build_delete_query(table, batch.len());
                let params: Vec<&(dyn ToSql + Sync)> = batch
                    .iter()
                    .flat_map(|parts| parts.iter().map(|p| p as &(dyn ToSql + Sync)))
                    .collect();

                deleted += tx.execute(&query, &params).await.with_context(|| {
                    format!("Failed to delete rows from {}", table.qualified_name())
                })?;
            }

            Ok(deleted)
        }
    }
}

fn value_rows(table: &TableDescriptor, num_rows: usize) -> String {
    let num_cols = table.columns.len();
    (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = table
                .columns
                .iter()
                .enumerate()
                .map(|(col_idx, c)| typed_placeholder(row_idx * num_cols + col_idx + 1, &c.data_type))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_list(table: &TableDescriptor) -> String {
    table
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build an upsert for `num_rows` rows.
///
/// ```sql
/// INSERT INTO "schema"."table" ("id", "name")
/// VALUES (CAST($1::text AS bigint), CAST($2::text AS text)), ...
/// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
fn build_upsert_query(table: &TableDescriptor, primary_key_columns: &[String], num_rows: usize) -> String {
    let quoted_pk_columns: Vec<String> = primary_key_columns.iter().map(|c| quote_ident(c)).collect();

    let update_columns: Vec<String> = table
        .columns
        .iter()
        .filter(|c| !primary_key_columns.contains(&c.name))
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(&c.name)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        // Every column is part of the key
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
        qualified(table),
        column_list(table),
        value_rows(table, num_rows),
        quoted_pk_columns.join(", "),
        update_clause
    )
}

/// Plain multi-row insert for keyless tables.
fn build_insert_query(table: &TableDescriptor, num_rows: usize) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES {}",
        qualified(table),
        column_list(table),
        value_rows(table, num_rows)
    )
}

/// Build a delete by primary key.
///
/// Single-column keys use `"id" IN (...)`, composite keys compare row
/// constructors: `("a", "b") IN ((..), (..))`.
fn build_delete_query(table: &TableDescriptor, num_rows: usize) -> String {
    let key_columns = table.key_columns();
    let num_pk_cols = key_columns.len();

    if num_pk_cols == 1 {
        let column = key_columns[0];
        let placeholders: Vec<String> = (1..=num_rows)
            .map(|i| typed_placeholder(i, &column.data_type))
            .collect();

        format!(
            "DELETE FROM {} WHERE {} IN ({})",
            qualified(table),
            quote_ident(&column.name),
            placeholders.join(", ")
        )
    } else {
        let pk_cols: Vec<String> = key_columns.iter().map(|c| quote_ident(&c.name)).collect();

        let value_tuples: Vec<String> = (0..num_rows)
            .map(|row_idx| {
                let placeholders: Vec<String> = key_columns
                    .iter()
                    .enumerate()
                    .map(|(col_idx, c)| {
                        typed_placeholder(row_idx * num_pk_cols + col_idx + 1, &c.data_type)
                    })
                    .collect();
                format!("({})", placeholders.join(", "))
            })
            .collect();

        format!(
            "DELETE FROM {} WHERE ({}) IN ({})",
            qualified(table),
            pk_cols.join(", "),
            value_tuples.join(", ")
        )
    }
}

/// Delete keyless rows by the physical locators captured during the scan.
fn build_locator_delete_query(table: &TableDescriptor) -> String {
    format!(
        "DELETE FROM {} WHERE ctid = ANY(CAST($1::text[] AS tid[]))",
        qualified(table)
    )
}
