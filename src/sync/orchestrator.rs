// ABOUTME: Sync orchestrator - one snapshot, one table queue, a fixed pool of workers
// ABOUTME: Commits the source snapshot only when every table synced; reports the first failure

use anyhow::{Context, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::backend::{SourceSnapshot, SyncBackend, TableReader, TargetSession};
use super::error::SyncError;
use super::stats::{SyncSummary, TableStats};
use super::table::sync_table;
use crate::config::SyncConfig;

/// Run one data sync.
///
/// Opens a REPEATABLE READ snapshot on the source, optionally drops target
/// tables the source no longer has, then lets `config.worker_count()` workers
/// drain the table queue. Target writes are committed chunk by chunk and stay
/// applied even when the run fails; only the source snapshot is rolled back.
pub async fn run_data_sync(backend: &dyn SyncBackend, config: &SyncConfig) -> Result<SyncSummary> {
    config.validate()?;
    let started = Instant::now();

    tracing::info!("Starting data sync of schema {}", config.schema);
    let snapshot = backend
        .open_snapshot()
        .await
        .context("Failed to open snapshot transaction on source")?;

    match run_in_snapshot(backend, snapshot.as_ref(), config).await {
        Ok(mut summary) => {
            snapshot
                .commit()
                .await
                .context("Failed to commit source snapshot transaction")?;
            summary.duration_ms = started.elapsed().as_millis() as u64;
            tracing::info!(
                "Data sync finished: {} tables, +{} / ~{} / -{} rows in {}ms",
                summary.tables.len(),
                summary.inserted(),
                summary.updated(),
                summary.deleted(),
                summary.duration_ms
            );
            Ok(summary)
        }
        Err(e) => {
            if let Err(rollback_err) = snapshot.rollback().await {
                tracing::warn!(
                    "Failed to roll back source snapshot transaction: {:#}",
                    rollback_err
                );
            }
            Err(e)
        }
    }
}

async fn run_in_snapshot(
    backend: &dyn SyncBackend,
    snapshot: &dyn SourceSnapshot,
    config: &SyncConfig,
) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();

    let source_tables = snapshot
        .reader()
        .list_tables(&config.schema)
        .await
        .context("Failed to list source tables")?;
    tracing::info!(
        "Found {} tables in schema {} of the source",
        source_tables.len(),
        config.schema
    );
    if source_tables.is_empty() {
        tracing::info!("No source tables to sync");
        return Ok(summary);
    }

    let admin = backend
        .open_target()
        .await
        .context("Failed to connect to target")?;
    let target_tables = admin
        .list_tables(&config.schema)
        .await
        .context("Failed to list target tables")?;

    if config.clean_extra {
        summary.dropped_tables =
            drop_extra_tables(admin.as_ref(), &config.schema, &source_tables, &target_tables)
                .await;
    }
    drop(admin);

    let workers = config.worker_count().min(source_tables.len());
    tracing::info!(
        "Starting {} workers for {} tables",
        workers,
        source_tables.len()
    );

    // Connections are opened up front so a connectivity failure aborts the run
    // before any table is touched.
    let mut sessions = Vec::with_capacity(workers);
    for worker in 1..=workers {
        let source = snapshot
            .attach()
            .await
            .with_context(|| format!("Failed to attach worker {} to the source snapshot", worker))?;
        let target = backend
            .open_target()
            .await
            .with_context(|| format!("Failed to open target session for worker {}", worker))?;
        sessions.push((worker, source, target));
    }

    let queue = Arc::new(TableQueue::new(source_tables));
    let first_error = Arc::new(FirstError::default());
    let config = Arc::new(config.clone());

    let handles: Vec<_> = sessions
        .into_iter()
        .map(|(worker, source, target)| {
            let queue = Arc::clone(&queue);
            let first_error = Arc::clone(&first_error);
            let config = Arc::clone(&config);
            let handle = tokio::spawn(run_worker(
                worker,
                source,
                target,
                config,
                queue,
                first_error,
            ));
            (worker, handle)
        })
        .collect();

    for (worker, handle) in handles {
        match handle.await {
            Ok(stats) => summary.tables.extend(stats),
            Err(e) => first_error.record(
                SyncError::Worker {
                    worker,
                    reason: e.to_string(),
                }
                .into(),
            ),
        }
    }

    if let Some(error) = first_error.take() {
        return Err(error);
    }

    summary.tables.sort_by(|a, b| a.table.cmp(&b.table));
    Ok(summary)
}

/// Pull tables until the queue is empty or one of them fails.
async fn run_worker(
    worker: usize,
    source: Box<dyn TableReader>,
    target: Box<dyn TargetSession>,
    config: Arc<SyncConfig>,
    queue: Arc<TableQueue>,
    first_error: Arc<FirstError>,
) -> Vec<TableStats> {
    let mut done = Vec::new();

    while let Some(table) = queue.pop() {
        tracing::info!("[worker {}] syncing {}.{}", worker, config.schema, table);
        match sync_table(&config, source.as_ref(), target.as_ref(), &table).await {
            Ok(stats) => done.push(stats),
            Err(e) => {
                tracing::error!(
                    "[worker {}] {}.{} failed: {:#}",
                    worker,
                    config.schema,
                    table,
                    e
                );
                let error = match e.downcast::<SyncError>() {
                    Ok(sync_error) => sync_error.into(),
                    Err(other) => {
                        SyncError::table(format!("{}.{}", config.schema, table), other).into()
                    }
                };
                first_error.record(error);
                return done;
            }
        }
    }

    tracing::info!("[worker {}] table queue drained", worker);
    done
}

/// Drop target tables missing from the source. Failures are logged and
/// skipped. Returns the tables actually dropped.
async fn drop_extra_tables(
    target: &dyn TargetSession,
    schema: &str,
    source_tables: &[String],
    target_tables: &[String],
) -> Vec<String> {
    let keep: HashSet<&str> = source_tables.iter().map(String::as_str).collect();
    let mut dropped = Vec::new();

    for table in target_tables {
        if keep.contains(table.as_str()) {
            continue;
        }
        match target.drop_table(schema, table).await {
            Ok(()) => {
                tracing::info!(
                    "Dropped target table {}.{} (not present on source)",
                    schema,
                    table
                );
                dropped.push(table.clone());
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to drop extra target table {}.{}: {:#}",
                    schema,
                    table,
                    e
                );
            }
        }
    }

    dropped
}

/// Pre-filled queue handing each table to exactly one worker.
struct TableQueue {
    tables: Mutex<VecDeque<String>>,
}

impl TableQueue {
    fn new(tables: Vec<String>) -> Self {
        Self {
            tables: Mutex::new(tables.into()),
        }
    }

    fn pop(&self) -> Option<String> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

/// Write-once slot for the first error of the run; later errors are dropped.
#[derive(Default)]
struct FirstError {
    slot: Mutex<Option<anyhow::Error>>,
}

impl FirstError {
    fn record(&self, error: anyhow::Error) {
        let mut slot = self
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take(&self) -> Option<anyhow::Error> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
