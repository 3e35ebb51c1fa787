// ABOUTME: Snapshot-consistent data sync engine: scan, fingerprint, diff, apply
// ABOUTME: Database access goes through the traits in `backend` so the engine is backend-agnostic

pub mod backend;
pub mod chunks;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod orchestrator;
pub mod stats;
pub mod table;
pub mod types;

pub use backend::{
    ApplyOutcome, ChangeApplier, SourceSnapshot, SyncBackend, TableReader, TargetSession,
};
pub use diff::{diff, ChangeSet};
pub use error::SyncError;
pub use fingerprint::{Fingerprint, RowCollector, ScannedRow, ScannedRows};
pub use orchestrator::run_data_sync;
pub use stats::{Strategy, SyncSummary, TableStats};
pub use table::sync_table;
pub use types::{
    ColumnInfo, PrimaryKey, RowIdentity, RowKey, ScanRange, TableDescriptor, Value,
};
