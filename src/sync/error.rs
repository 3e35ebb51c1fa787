// ABOUTME: Run-level failure kinds of the sync engine
// ABOUTME: Chunk failures are folded into a table failure, table failures fail the run

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A table could not be synchronized; the first such table fails the run.
    #[error("table {table} failed to sync: {source}")]
    Table {
        table: String,
        #[source]
        source: BoxError,
    },

    /// Some chunks of a table failed while the rest were applied.
    #[error("{failed} of {total} chunks of {table} failed; first failure at {range}: {first}")]
    Chunks {
        table: String,
        failed: u64,
        total: u64,
        range: String,
        first: String,
    },

    /// A worker task ended without reporting back.
    #[error("worker {worker} stopped unexpectedly: {reason}")]
    Worker { worker: usize, reason: String },
}

impl SyncError {
    pub fn table(table: impl Into<String>, source: anyhow::Error) -> Self {
        SyncError::Table {
            table: table.into(),
            source: source.into(),
        }
    }

    /// Name of the table the error refers to, if any.
    pub fn table_name(&self) -> Option<&str> {
        match self {
            SyncError::Table { table, .. } | SyncError::Chunks { table, .. } => Some(table),
            SyncError::Worker { .. } => None,
        }
    }
}
