// ABOUTME: Catalog inspection and range scans against a PostgreSQL database
// ABOUTME: Every value is read as its server text rendering and fingerprinted as it arrives

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::Client;

use crate::config::WATERMARK_FORMAT;
use crate::sync::{
    ColumnInfo, PrimaryKey, RowCollector, RowKey, ScanRange, ScannedRows,
    TableDescriptor, TableReader, Value,
};
use crate::utils::quote_ident;

/// PostgreSQL caps a statement at 65535 bind parameters; keep some margin.
pub const MAX_BIND_PARAMS: usize = 65_000;

pub(crate) type SqlParam = Box<dyn ToSql + Sync + Send>;

/// A read-only view of one database through one connection.
///
/// The connection may sit inside an open transaction; every query runs in
/// whatever transaction the connection currently holds.
pub struct PgTableReader {
    client: Client,
}

impl PgTableReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl TableReader for PgTableReader {
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        list_tables(&self.client, schema).await
    }

    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        list_columns(&self.client, schema, table).await
    }

    async fn primary_key(&self, schema: &str, table: &str) -> Result<PrimaryKey> {
        primary_key(&self.client, schema, table).await
    }

    async fn key_bounds(&self, table: &TableDescriptor) -> Result<Option<(i64, i64)>> {
        key_bounds(&self.client, table).await
    }

    async fn scan(&self, table: &TableDescriptor, range: &ScanRange) -> Result<ScannedRows> {
        scan(&self.client, table, range).await
    }
}

/// Base tables of a schema, ordered by name.
pub async fn list_tables(client: &Client, schema: &str) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT table_name::text
             FROM information_schema.tables
             WHERE table_schema = $1 AND table_type = 'BASE TABLE'
             ORDER BY table_name",
            &[&schema],
        )
        .await
        .with_context(|| format!("Failed to list tables in schema {}", schema))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Columns in ordinal order with their declared types.
///
/// Dropped and generated columns are skipped: the first no longer exist and
/// the second cannot be written.
pub async fn list_columns(client: &Client, schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
    let rows = client
        .query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1
               AND c.relname = $2
               AND a.attnum > 0
               AND NOT a.attisdropped
               AND a.attgenerated = ''
             ORDER BY a.attnum",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get columns for {}.{}", schema, table))?;

    Ok(rows
        .iter()
        .map(|row| ColumnInfo::new(row.get::<_, String>(0), row.get::<_, String>(1)))
        .collect())
}

/// Primary key columns in key order.
pub async fn primary_key(client: &Client, schema: &str, table: &str) -> Result<PrimaryKey> {
    let rows = client
        .query(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE i.indisprimary
               AND n.nspname = $1
               AND c.relname = $2
             ORDER BY array_position(i.indkey::int2[], a.attnum)",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to get primary key for {}.{}", schema, table))?;

    let columns: Vec<ColumnInfo> = rows
        .iter()
        .map(|row| ColumnInfo::new(row.get::<_, String>(0), row.get::<_, String>(1)))
        .collect();

    Ok(PrimaryKey {
        single_numeric: columns.len() == 1 && columns[0].is_integer(),
        columns: columns.into_iter().map(|c| c.name).collect(),
    })
}

/// `MIN`/`MAX` of the single integer key, `None` for an empty table.
pub async fn key_bounds(client: &Client, table: &TableDescriptor) -> Result<Option<(i64, i64)>> {
    let key = single_key_column(table)?;
    let query = format!(
        "SELECT MIN({key})::bigint, MAX({key})::bigint FROM {}",
        qualified(table),
        key = quote_ident(key)
    );

    let row = client
        .query_one(&query, &[])
        .await
        .with_context(|| format!("Failed to read key bounds of {}", table.qualified_name()))?;

    let min: Option<i64> = row.get(0);
    let max: Option<i64> = row.get(1);
    Ok(min.zip(max))
}

/// Read every row of `range` and fingerprint it.
pub async fn scan(client: &Client, table: &TableDescriptor, range: &ScanRange) -> Result<ScannedRows> {
    let mut scanned = ScannedRows::new();

    for (query, params) in build_scan_queries(table, range)? {
        let refs = params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync));
        let stream = client
            .query_raw(&query, refs)
            .await
            .with_context(|| format!("Failed to scan {} {}", table.qualified_name(), range))?;
        futures::pin_mut!(stream);

        let width = table.columns.len();
        let mut collector = RowCollector::new(table);
        while let Some(row) = stream
            .try_next()
            .await
            .with_context(|| format!("Failed to read rows of {} {}", table.qualified_name(), range))?
        {
            let mut values: Vec<Value> = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(row.try_get(idx).with_context(|| {
                    format!(
                        "Failed to read column '{}' of {}",
                        table.columns[idx].name,
                        table.qualified_name()
                    )
                })?);
            }
            let locator: Option<String> = if table.has_primary_key() {
                None
            } else {
                row.try_get(width)
                    .context("Failed to read row locator")?
            };
            collector.push(values, locator)?;
        }
        scanned.extend(collector.finish());
    }

    Ok(scanned)
}

pub(crate) fn qualified(table: &TableDescriptor) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.name))
}

/// `CAST($n::text AS <type>)`: hands a rendered value back to the server for
/// parsing with the column's own input function.
pub(crate) fn typed_placeholder(n: usize, data_type: &str) -> String {
    format!("CAST(${}::text AS {})", n, data_type)
}

fn single_key_column(table: &TableDescriptor) -> Result<&str> {
    match table.key_indexes() {
        [idx] => Ok(table.columns[*idx].name.as_str()),
        _ => bail!(
            "{} has no single-column primary key",
            table.qualified_name()
        ),
    }
}

/// SELECT list: every column as text, plus `ctid` for keyless tables.
fn select_list(table: &TableDescriptor) -> String {
    let mut items: Vec<String> = table
        .columns
        .iter()
        .map(|c| format!("{}::text", quote_ident(&c.name)))
        .collect();
    if !table.has_primary_key() {
        items.push("ctid::text".to_string());
    }
    items.join(", ")
}

fn key_tuple(table: &TableDescriptor) -> String {
    table
        .key_columns()
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// One or more SELECTs covering `range`. Key lists are split so no statement
/// exceeds [`MAX_BIND_PARAMS`].
fn build_scan_queries(
    table: &TableDescriptor,
    range: &ScanRange,
) -> Result<Vec<(String, Vec<SqlParam>)>> {
    let base = format!("SELECT {} FROM {}", select_list(table), qualified(table));

    match range {
        ScanRange::All => Ok(vec![(base, Vec::new())]),

        ScanRange::KeyRange { lo, hi } => {
            let key = quote_ident(single_key_column(table)?);
            Ok(vec![(
                format!("{} WHERE {} BETWEEN $1::bigint AND $2::bigint", base, key),
                vec![Box::new(*lo) as SqlParam, Box::new(*hi) as SqlParam],
            )])
        }

        ScanRange::ModifiedSince {
            column,
            since,
            after,
            limit,
        } => {
            let Some(ts_column) = table.column(column) else {
                bail!(
                    "{} has no column '{}'",
                    table.qualified_name(),
                    column
                );
            };
            let key_columns = table.key_columns();
            if key_columns.is_empty() {
                bail!(
                    "{}: paging by modification time needs a primary key",
                    table.qualified_name()
                );
            }

            let mut params: Vec<SqlParam> =
                vec![Box::new(since.format(WATERMARK_FORMAT).to_string()) as SqlParam];
            let mut query = format!(
                "{} WHERE {} > {}",
                base,
                quote_ident(&ts_column.name),
                typed_placeholder(1, &ts_column.data_type)
            );

            if let Some(cursor) = after {
                if cursor.parts().len() != key_columns.len() {
                    bail!(
                        "{}: cursor {} does not match the primary key",
                        table.qualified_name(),
                        cursor
                    );
                }
                let placeholders: Vec<String> = key_columns
                    .iter()
                    .enumerate()
                    .map(|(i, c)| typed_placeholder(i + 2, &c.data_type))
                    .collect();
                query.push_str(&format!(
                    " AND ({}) > ({})",
                    key_tuple(table),
                    placeholders.join(", ")
                ));
                params.extend(
                    cursor
                        .parts()
                        .iter()
                        .map(|p| Box::new(p.clone()) as SqlParam),
                );
            }

            query.push_str(&format!(" ORDER BY {} LIMIT {}", key_tuple(table), limit));
            Ok(vec![(query, params)])
        }

        ScanRange::Keys(keys) => {
            let key_columns = table.key_columns();
            if key_columns.is_empty() {
                bail!(
                    "{}: lookup by key needs a primary key",
                    table.qualified_name()
                );
            }
            let per_statement = (MAX_BIND_PARAMS / key_columns.len()).max(1);

            keys.chunks(per_statement)
                .map(|batch| {
                    let tuples: Vec<String> = (0..batch.len())
                        .map(|row_idx| {
                            let placeholders: Vec<String> = key_columns
                                .iter()
                                .enumerate()
                                .map(|(col_idx, c)| {
                                    typed_placeholder(
                                        row_idx * key_columns.len() + col_idx + 1,
                                        &c.data_type,
                                    )
                                })
                                .collect();
                            format!("({})", placeholders.join(", "))
                        })
                        .collect();
                    let params = batch
                        .iter()
                        .flat_map(|key: &RowKey| key.parts().iter())
                        .map(|p| Box::new(p.clone()) as SqlParam)
                        .collect();
                    Ok((
                        format!(
                            "{} WHERE ({}) IN ({})",
                            base,
                            key_tuple(table),
                            tuples.join(", ")
                        ),
                        params,
                    ))
                })
                .collect()
        }
    }
}
