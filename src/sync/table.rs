// ABOUTME: Per-table strategy selection and the chunked, full-diff, and incremental strategies
// ABOUTME: Each strategy scans both sides, diffs the fingerprints, and applies the change set

use anyhow::{Context, Result};
use chrono::NaiveDateTime;

use super::backend::{TableReader, TargetSession};
use super::chunks::{chunk_count, chunk_ranges};
use super::diff::diff;
use super::error::SyncError;
use super::fingerprint::ScannedRows;
use super::stats::{Strategy, TableStats};
use super::types::{PrimaryKey, RowIdentity, RowKey, ScanRange, TableDescriptor};
use crate::config::{SyncConfig, SyncMode};

/// Synchronize one table of `config.schema`, choosing the strategy from the
/// run mode and the table's primary key.
///
/// `source` must read from the run's snapshot. Chunk-level failures do not
/// stop the table early but are reported as [`SyncError::Chunks`] once every
/// chunk has been attempted.
pub async fn sync_table(
    config: &SyncConfig,
    source: &dyn TableReader,
    target: &dyn TargetSession,
    table: &str,
) -> Result<TableStats> {
    match &config.mode {
        SyncMode::ForeignDataWrapper => {
            tracing::debug!(
                "FDW mode: {}.{} is served through postgres_fdw, skipping data sync",
                config.schema,
                table
            );
            Ok(TableStats::new(table, Strategy::ForeignDataWrapper))
        }
        SyncMode::Incremental { column, since } => {
            sync_incremental(config, source, target, table, column, *since).await
        }
        SyncMode::Diff => {
            let pk = detect_primary_key(source, &config.schema, table).await;
            let Some(descriptor) = describe(config, source, table, &pk).await? else {
                return Ok(TableStats::new(table, Strategy::FullDiff));
            };

            if pk.is_empty() {
                tracing::warn!(
                    "Table {} has no primary key, using full diff",
                    descriptor.qualified_name()
                );
                sync_full_diff(config, source, target, &descriptor).await
            } else if pk.single_numeric && pk.columns.len() == 1 {
                sync_by_chunks(config, source, target, &descriptor).await
            } else {
                tracing::info!(
                    "Table {} has a composite or non-numeric primary key {:?}, using full diff",
                    descriptor.qualified_name(),
                    pk.columns
                );
                sync_full_diff(config, source, target, &descriptor).await
            }
        }
    }
}

/// Look up the primary key, treating any catalog failure as "no key" so the
/// table falls back to the full-diff strategy instead of failing.
async fn detect_primary_key(source: &dyn TableReader, schema: &str, table: &str) -> PrimaryKey {
    match source.primary_key(schema, table).await {
        Ok(pk) => {
            tracing::debug!(
                "Table {}.{}: primary key {:?}, single numeric = {}",
                schema,
                table,
                pk.columns,
                pk.single_numeric
            );
            pk
        }
        Err(e) => {
            tracing::warn!(
                "Failed to read primary key of {}.{}: {:#}. Treating it as keyless",
                schema,
                table,
                e
            );
            PrimaryKey::none()
        }
    }
}

/// Build the descriptor from the source catalog. `None` for a table without
/// columns, which has nothing to sync.
async fn describe(
    config: &SyncConfig,
    source: &dyn TableReader,
    table: &str,
    pk: &PrimaryKey,
) -> Result<Option<TableDescriptor>> {
    let columns = source
        .list_columns(&config.schema, table)
        .await
        .with_context(|| format!("Failed to list columns of {}.{}", config.schema, table))?;

    if columns.is_empty() {
        tracing::info!(
            "Table {}.{} has no columns, skipping",
            config.schema,
            table
        );
        return Ok(None);
    }

    let identity = if pk.is_empty() {
        RowIdentity::WholeRow
    } else {
        RowIdentity::PrimaryKey(pk.columns.clone())
    };

    TableDescriptor::new(&config.schema, table, columns, identity).map(Some)
}

/// Walk the single integer key of `table` in `chunk_size` intervals.
pub async fn sync_by_chunks(
    config: &SyncConfig,
    source: &dyn TableReader,
    target: &dyn TargetSession,
    table: &TableDescriptor,
) -> Result<TableStats> {
    let mut stats = TableStats::new(&table.name, Strategy::Chunked);

    let bounds = source
        .key_bounds(table)
        .await
        .with_context(|| format!("Failed to read key bounds of {}", table.qualified_name()))?;
    let Some((min, max)) = bounds else {
        tracing::info!("Table {} is empty, nothing to sync", table.qualified_name());
        return Ok(stats);
    };

    let total = chunk_count(min, max, config.chunk_size);
    tracing::info!(
        "Syncing {} by chunks: keys [{}..{}], chunk size {}, {} chunks",
        table.qualified_name(),
        min,
        max,
        config.chunk_size,
        total
    );

    let mut failures = ChunkFailures::default();
    for (lo, hi) in chunk_ranges(min, max, config.chunk_size) {
        stats.chunks += 1;
        let range = ScanRange::KeyRange { lo, hi };

        let result = async {
            let (source_rows, target_rows) = scan_both(source, target, table, &range).await?;
            reconcile(config, target, table, &range, &source_rows, &target_rows, &mut stats).await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "Chunk {} of {} failed, continuing with the next chunk: {:#}",
                range,
                table.qualified_name(),
                e
            );
            failures.record(&range, e);
        }
    }

    failures.into_result(table, stats)
}

/// Treat the whole table as a single chunk.
pub async fn sync_full_diff(
    config: &SyncConfig,
    source: &dyn TableReader,
    target: &dyn TargetSession,
    table: &TableDescriptor,
) -> Result<TableStats> {
    let mut stats = TableStats::new(&table.name, Strategy::FullDiff);
    stats.chunks = 1;

    let range = ScanRange::All;
    let (source_rows, target_rows) = scan_both(source, target, table, &range).await?;
    tracing::info!(
        "Full diff of {}: {} source rows, {} target rows",
        table.qualified_name(),
        source_rows.len(),
        target_rows.len()
    );
    reconcile(config, target, table, &range, &source_rows, &target_rows, &mut stats).await?;

    Ok(stats)
}

/// Sync only rows whose `column` is later than `since`, one key-ordered page
/// of `chunk_size` source rows at a time. The target is read for the same
/// keys, so this strategy never deletes.
pub async fn sync_incremental(
    config: &SyncConfig,
    source: &dyn TableReader,
    target: &dyn TargetSession,
    table: &str,
    column: &str,
    since: NaiveDateTime,
) -> Result<TableStats> {
    let pk = detect_primary_key(source, &config.schema, table).await;
    let Some(descriptor) = describe(config, source, table, &pk).await? else {
        return Ok(TableStats::new(table, Strategy::Incremental));
    };

    if pk.is_empty() {
        tracing::warn!(
            "Table {} has no primary key, incremental sync is not possible; using full diff",
            descriptor.qualified_name()
        );
        return sync_full_diff(config, source, target, &descriptor).await;
    }
    if descriptor.column(column).is_none() {
        tracing::warn!(
            "Table {} has no '{}' column, incremental sync is not possible; using full diff",
            descriptor.qualified_name(),
            column
        );
        return sync_full_diff(config, source, target, &descriptor).await;
    }

    tracing::info!(
        "Syncing {} incrementally: {} > {}",
        descriptor.qualified_name(),
        column,
        since
    );

    let mut stats = TableStats::new(table, Strategy::Incremental);
    let page_size = usize::try_from(config.chunk_size).unwrap_or(usize::MAX).max(1);
    let mut failures = ChunkFailures::default();
    let mut cursor: Option<RowKey> = None;

    loop {
        let range = ScanRange::ModifiedSince {
            column: column.to_string(),
            since,
            after: cursor.clone(),
            limit: page_size,
        };

        // Without this page the cursor cannot advance, so a failure here ends the table.
        let source_rows = source.scan(&descriptor, &range).await.with_context(|| {
            format!(
                "Failed to scan source {} {}",
                descriptor.qualified_name(),
                range
            )
        })?;
        if source_rows.is_empty() {
            break;
        }
        stats.chunks += 1;

        let fetched = source_rows.len();
        let next_cursor = source_rows.last_key().cloned();

        let result = async {
            let keys: Vec<RowKey> = source_rows.keys().cloned().collect();
            let target_rows = target
                .scan(&descriptor, &ScanRange::Keys(keys))
                .await
                .with_context(|| format!("Failed to scan target {}", descriptor.qualified_name()))?;
            reconcile(
                config,
                target,
                &descriptor,
                &range,
                &source_rows,
                &target_rows,
                &mut stats,
            )
            .await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                "Page {} of {} failed, continuing with the next page: {:#}",
                range,
                descriptor.qualified_name(),
                e
            );
            failures.record(&range, e);
        }

        match next_cursor {
            Some(key) if fetched >= page_size => cursor = Some(key),
            _ => break,
        }
    }

    failures.into_result(&descriptor, stats)
}

async fn scan_both(
    source: &dyn TableReader,
    target: &dyn TargetSession,
    table: &TableDescriptor,
    range: &ScanRange,
) -> Result<(ScannedRows, ScannedRows)> {
    let source_scan = async {
        source.scan(table, range).await.with_context(|| {
            format!("Failed to scan source {} {}", table.qualified_name(), range)
        })
    };
    let target_scan = async {
        target.scan(table, range).await.with_context(|| {
            format!("Failed to scan target {} {}", table.qualified_name(), range)
        })
    };
    tokio::try_join!(source_scan, target_scan)
}

/// Diff one chunk and apply whatever differs.
async fn reconcile(
    config: &SyncConfig,
    target: &dyn TargetSession,
    table: &TableDescriptor,
    range: &ScanRange,
    source_rows: &ScannedRows,
    target_rows: &ScannedRows,
    stats: &mut TableStats,
) -> Result<()> {
    let changes = diff(source_rows, target_rows);
    if changes.is_empty() {
        tracing::debug!("{} {}: in sync", table.qualified_name(), range);
        return Ok(());
    }

    let outcome = target
        .apply_changes(
            table,
            &changes,
            source_rows,
            target_rows,
            config.delete_policy,
        )
        .await
        .with_context(|| format!("Failed to apply changes to {} {}", table.qualified_name(), range))?;

    tracing::info!(
        "{} {}: +{} / ~{} / -{}",
        table.qualified_name(),
        range,
        changes.insert.len(),
        changes.update.len(),
        outcome.deleted
    );
    stats.record_applied(&changes, &outcome);
    Ok(())
}

/// Failed chunks of one table; the first error is kept for the report.
#[derive(Default)]
struct ChunkFailures {
    count: u64,
    first: Option<(String, anyhow::Error)>,
}

impl ChunkFailures {
    fn record(&mut self, range: &ScanRange, error: anyhow::Error) {
        self.count += 1;
        if self.first.is_none() {
            self.first = Some((range.to_string(), error));
        }
    }

    fn into_result(self, table: &TableDescriptor, mut stats: TableStats) -> Result<TableStats> {
        stats.failed_chunks = self.count;
        match self.first {
            None => {
                tracing::info!(
                    "Finished {}: {} chunks, +{} / ~{} / -{}",
                    table.qualified_name(),
                    stats.chunks,
                    stats.inserted,
                    stats.updated,
                    stats.deleted
                );
                Ok(stats)
            }
            Some((range, error)) => Err(SyncError::Chunks {
                table: table.qualified_name(),
                failed: self.count,
                total: stats.chunks,
                range,
                first: format!("{:#}", error),
            }
            .into()),
        }
    }
}
