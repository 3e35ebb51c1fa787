// ABOUTME: PostgreSQL implementation of the sync engine's connection provider
// ABOUTME: Exports one REPEATABLE READ snapshot and attaches worker connections to it

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::connection::connect_with_retry;
use super::reader::PgTableReader;
use super::writer::PgTargetSession;
use crate::sync::{SourceSnapshot, SyncBackend, TableReader, TargetSession};
use crate::utils::quote_literal;

/// Opens source snapshots and target sessions from two connection URLs.
pub struct PgBackend {
    source_url: String,
    target_url: String,
}

impl PgBackend {
    pub fn new(source_url: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            target_url: target_url.into(),
        }
    }
}

#[async_trait]
impl SyncBackend for PgBackend {
    async fn open_snapshot(&self) -> Result<Box<dyn SourceSnapshot>> {
        let client = connect_with_retry(&self.source_url)
            .await
            .context("Failed to connect to source database")?;

        client
            .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ")
            .await
            .context("Failed to begin snapshot transaction")?;

        let row = client
            .query_one("SELECT pg_export_snapshot()", &[])
            .await
            .context("Failed to export source snapshot")?;
        let snapshot_id: String = row.get(0);
        tracing::debug!("Exported source snapshot {}", snapshot_id);

        Ok(Box::new(PgSnapshot {
            reader: PgTableReader::new(client),
            snapshot_id,
            source_url: self.source_url.clone(),
        }))
    }

    async fn open_target(&self) -> Result<Box<dyn TargetSession>> {
        let client = connect_with_retry(&self.target_url)
            .await
            .context("Failed to connect to target database")?;
        Ok(Box::new(PgTargetSession::new(client)))
    }
}

/// The coordinating source transaction. Attached readers import its snapshot
/// id; the snapshot stays importable only while this transaction is open.
pub struct PgSnapshot {
    reader: PgTableReader,
    snapshot_id: String,
    source_url: String,
}

#[async_trait]
impl SourceSnapshot for PgSnapshot {
    fn reader(&self) -> &dyn TableReader {
        &self.reader
    }

    async fn attach(&self) -> Result<Box<dyn TableReader>> {
        let client = connect_with_retry(&self.source_url)
            .await
            .context("Failed to connect to source database")?;

        client
            .batch_execute(&format!(
                "BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY; SET TRANSACTION SNAPSHOT {}",
                quote_literal(&self.snapshot_id)
            ))
            .await
            .with_context(|| format!("Failed to import source snapshot {}", self.snapshot_id))?;

        Ok(Box::new(PgTableReader::new(client)))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.reader
            .client()
            .batch_execute("COMMIT")
            .await
            .context("Failed to commit snapshot transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.reader
            .client()
            .batch_execute("ROLLBACK")
            .await
            .context("Failed to roll back snapshot transaction")
    }
}
