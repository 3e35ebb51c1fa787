// ABOUTME: Counters reported by a sync run, per table and for the whole run
// ABOUTME: Serializable so the CLI can print the run summary as JSON

use serde::Serialize;

use super::backend::ApplyOutcome;
use super::diff::ChangeSet;

/// Strategy the selector picked for a table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Chunked,
    FullDiff,
    Incremental,
    #[serde(rename = "fdw")]
    ForeignDataWrapper,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Chunked => "chunked",
            Strategy::FullDiff => "full-diff",
            Strategy::Incremental => "incremental",
            Strategy::ForeignDataWrapper => "fdw",
        }
    }
}

/// What happened to one table.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableStats {
    pub table: String,
    pub strategy: Strategy,
    pub chunks: u64,
    pub changed_chunks: u64,
    pub failed_chunks: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    pub skipped_deletes: u64,
}

impl TableStats {
    pub fn new(table: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            table: table.into(),
            strategy,
            ..Self::default()
        }
    }

    /// Count one applied chunk. Inserts and updates are taken from the change
    /// set since the upsert statement reports them together.
    pub fn record_applied(&mut self, changes: &ChangeSet, outcome: &ApplyOutcome) {
        self.changed_chunks += 1;
        self.inserted += changes.insert.len() as u64;
        self.updated += changes.update.len() as u64;
        self.deleted += outcome.deleted;
        if outcome.delete_skipped {
            self.skipped_deletes += changes.delete.len() as u64;
        }
    }

    pub fn rows_written(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub tables: Vec<TableStats>,
    pub dropped_tables: Vec<String>,
    pub duration_ms: u64,
}

impl SyncSummary {
    pub fn inserted(&self) -> u64 {
        self.tables.iter().map(|t| t.inserted).sum()
    }

    pub fn updated(&self) -> u64 {
        self.tables.iter().map(|t| t.updated).sum()
    }

    pub fn deleted(&self) -> u64 {
        self.tables.iter().map(|t| t.deleted).sum()
    }

    pub fn rows_written(&self) -> u64 {
        self.tables.iter().map(TableStats::rows_written).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableStats> {
        self.tables.iter().find(|t| t.table == name)
    }
}
