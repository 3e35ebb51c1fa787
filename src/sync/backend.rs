// ABOUTME: Database seams of the sync engine - what it needs from each side
// ABOUTME: Implemented for PostgreSQL in crate::postgres and by in-memory fakes in tests

use anyhow::Result;
use async_trait::async_trait;

use super::diff::ChangeSet;
use super::fingerprint::ScannedRows;
use super::types::{ColumnInfo, PrimaryKey, ScanRange, TableDescriptor};
use crate::config::DeletePolicy;

/// Catalog inspection and range scanning against one database.
#[async_trait]
pub trait TableReader: Send + Sync {
    /// Base tables of `schema`, ordered by name.
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    /// Columns of a table in ordinal order.
    async fn list_columns(&self, schema: &str, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Primary key columns in key order, plus whether the key is a single
    /// integer column. An empty column list means the table has no key.
    async fn primary_key(&self, schema: &str, table: &str) -> Result<PrimaryKey>;

    /// Smallest and largest value of the table's single integer key, or
    /// `None` when the table is empty.
    async fn key_bounds(&self, table: &TableDescriptor) -> Result<Option<(i64, i64)>>;

    /// Read and fingerprint every row of `table` that falls in `range`.
    async fn scan(&self, table: &TableDescriptor, range: &ScanRange) -> Result<ScannedRows>;
}

/// Writes against the target database.
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    /// Apply one chunk's change set in a single transaction.
    ///
    /// Upserts take their values from `source`; deletes of keyless rows use
    /// the locators captured in `target`.
    async fn apply_changes(
        &self,
        table: &TableDescriptor,
        changes: &ChangeSet,
        source: &ScannedRows,
        target: &ScannedRows,
        policy: DeletePolicy,
    ) -> Result<ApplyOutcome>;

    async fn drop_table(&self, schema: &str, table: &str) -> Result<()>;
}

/// Rows actually written by one [`ChangeApplier::apply_changes`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub upserted: u64,
    pub deleted: u64,
    /// The delete statement failed and was rolled back on its own.
    pub delete_skipped: bool,
}

/// A target connection: it reads like a source and also accepts writes.
pub trait TargetSession: TableReader + ChangeApplier {}

impl<T: TableReader + ChangeApplier> TargetSession for T {}

/// The run-wide read snapshot on the source database.
#[async_trait]
pub trait SourceSnapshot: Send + Sync {
    /// Reader bound to the snapshot's own transaction.
    fn reader(&self) -> &dyn TableReader;

    /// Open another reader that observes exactly the same snapshot.
    async fn attach(&self) -> Result<Box<dyn TableReader>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens the connections a sync run needs.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Start the run's REPEATABLE READ snapshot on the source.
    async fn open_snapshot(&self) -> Result<Box<dyn SourceSnapshot>>;

    /// Open a fresh target session for one worker.
    async fn open_target(&self) -> Result<Box<dyn TargetSession>>;
}
