// ABOUTME: In-memory SyncBackend for driving the sync engine without PostgreSQL
// ABOUTME: Snapshots copy the source, the target is live, and faults can be injected per table or key

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use standby_sync::config::{DeletePolicy, WATERMARK_FORMAT};
use standby_sync::sync::{
    ApplyOutcome, ChangeApplier, ChangeSet, ColumnInfo, PrimaryKey, RowCollector, RowIdentity,
    RowKey, ScanRange, ScannedRows, SourceSnapshot, SyncBackend, TableDescriptor, TableReader,
    TargetSession, Value,
};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

pub fn v(value: &str) -> Value {
    Some(value.to_string())
}

#[derive(Debug, Clone)]
pub struct MemTable {
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Vec<String>,
    next_id: u64,
    rows: Vec<(u64, Vec<Value>)>,
}

impl MemTable {
    fn key_indexes(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|k| self.columns.iter().position(|c| &c.name == k))
            .collect()
    }

    fn key_of(&self, values: &[Value]) -> Vec<String> {
        self.key_indexes()
            .iter()
            .map(|&i| values[i].clone().unwrap_or_default())
            .collect()
    }

    fn upsert(&mut self, values: Vec<Value>) {
        if self.primary_key.is_empty() {
            self.push(values);
            return;
        }
        let key = self.key_of(&values);
        let existing = self
            .rows
            .iter()
            .position(|(_, row)| self.key_of(row) == key);
        match existing {
            Some(pos) => self.rows[pos].1 = values,
            None => self.push(values),
        }
    }

    /// INSERT without ON CONFLICT: a key collision fails like a unique violation.
    fn insert_plain(&mut self, values: Vec<Value>) -> Result<()> {
        if !self.primary_key.is_empty() {
            let key = self.key_of(&values);
            if self.rows.iter().any(|(_, row)| self.key_of(row) == key) {
                bail!("duplicate key value violates unique constraint");
            }
        }
        self.push(values);
        Ok(())
    }

    fn push(&mut self, values: Vec<Value>) {
        self.next_id += 1;
        self.rows.push((self.next_id, values));
    }
}

/// One side of the sync: a set of tables behind a lock.
#[derive(Clone, Default)]
pub struct MemDatabase {
    tables: Arc<Mutex<BTreeMap<String, MemTable>>>,
}

impl MemDatabase {
    pub fn create_table(&self, name: &str, columns: &[(&str, &str)], primary_key: &[&str]) {
        self.tables.lock().unwrap().insert(
            name.to_string(),
            MemTable {
                columns: columns
                    .iter()
                    .map(|(n, t)| ColumnInfo::new(*n, *t))
                    .collect(),
                primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
                next_id: 0,
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, table: &str, values: &[Option<&str>]) {
        let values = values.iter().map(|v| v.map(str::to_string)).collect();
        self.tables
            .lock()
            .unwrap()
            .get_mut(table)
            .expect("table exists")
            .push(values);
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.tables.lock().unwrap().contains_key(table)
    }

    /// Rows of a table, sorted so two databases can be compared.
    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Vec<Value>> = tables
            .get(table)
            .map(|t| t.rows.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default();
        rows.sort();
        rows
    }

    /// Values of the first column, parsed as integers and sorted.
    pub fn ids(&self, table: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .rows(table)
            .iter()
            .filter_map(|r| r[0].as_deref().and_then(|s| s.parse().ok()))
            .collect();
        ids.sort();
        ids
    }

    fn freeze(&self) -> Arc<BTreeMap<String, MemTable>> {
        Arc::new(self.tables.lock().unwrap().clone())
    }
}

/// Injected failures.
#[derive(Default)]
pub struct Faults {
    apply_keys: Mutex<HashMap<String, HashSet<String>>>,
    delete_tables: Mutex<HashSet<String>>,
    primary_key_tables: Mutex<HashSet<String>>,
    undroppable: Mutex<HashSet<String>>,
}

impl Faults {
    /// Any chunk of `table` touching `key` fails to apply.
    pub fn fail_apply_on(&self, table: &str, key: &str) {
        self.apply_keys
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string());
    }

    /// Delete statements against `table` fail.
    pub fn fail_deletes_on(&self, table: &str) {
        self.delete_tables.lock().unwrap().insert(table.to_string());
    }

    /// Primary key lookups of `table` fail on the source.
    pub fn fail_primary_key_on(&self, table: &str) {
        self.primary_key_tables
            .lock()
            .unwrap()
            .insert(table.to_string());
    }

    pub fn refuse_drop(&self, table: &str) {
        self.undroppable.lock().unwrap().insert(table.to_string());
    }
}

#[derive(Default)]
pub struct Counters {
    pub apply_calls: AtomicUsize,
    pub attaches: AtomicUsize,
    pub target_sessions: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl Counters {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub source: MemDatabase,
    pub target: MemDatabase,
    pub faults: Arc<Faults>,
    pub counters: Arc<Counters>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_calls(&self) -> usize {
        Counters::get(&self.counters.apply_calls)
    }

    pub fn commits(&self) -> usize {
        Counters::get(&self.counters.commits)
    }

    pub fn rollbacks(&self) -> usize {
        Counters::get(&self.counters.rollbacks)
    }

    /// Create the same table on both sides.
    pub fn create_table(&self, name: &str, columns: &[(&str, &str)], primary_key: &[&str]) {
        self.source.create_table(name, columns, primary_key);
        self.target.create_table(name, columns, primary_key);
    }
}

#[async_trait]
impl SyncBackend for MemoryBackend {
    async fn open_snapshot(&self) -> Result<Box<dyn SourceSnapshot>> {
        let tables = self.source.freeze();
        Ok(Box::new(MemSnapshot {
            reader: MemReader {
                tables: Arc::clone(&tables),
                faults: Arc::clone(&self.faults),
            },
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn open_target(&self) -> Result<Box<dyn TargetSession>> {
        self.counters
            .target_sessions
            .fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemTarget {
            db: self.target.clone(),
            faults: Arc::clone(&self.faults),
            counters: Arc::clone(&self.counters),
        }))
    }
}

struct MemSnapshot {
    reader: MemReader,
    counters: Arc<Counters>,
}

#[async_trait]
impl SourceSnapshot for MemSnapshot {
    fn reader(&self) -> &dyn TableReader {
        &self.reader
    }

    async fn attach(&self) -> Result<Box<dyn TableReader>> {
        self.counters.attaches.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemReader {
            tables: Arc::clone(&self.reader.tables),
            faults: Arc::clone(&self.reader.faults),
        }))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.counters.commits.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.counters.rollbacks.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(())
    }
}

/// Reader over a frozen copy of the source.
struct MemReader {
    tables: Arc<BTreeMap<String, MemTable>>,
    faults: Arc<Faults>,
}

#[async_trait]
impl TableReader for MemReader {
    async fn list_tables(&self, _schema: &str) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn list_columns(&self, _schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(lookup(&self.tables, table)?.columns.clone())
    }

    async fn primary_key(&self, _schema: &str, table: &str) -> Result<PrimaryKey> {
        if self.faults.primary_key_tables.lock().unwrap().contains(table) {
            bail!("permission denied for pg_index");
        }
        primary_key_of(lookup(&self.tables, table)?)
    }

    async fn key_bounds(&self, table: &TableDescriptor) -> Result<Option<(i64, i64)>> {
        key_bounds_of(lookup(&self.tables, &table.name)?)
    }

    async fn scan(&self, table: &TableDescriptor, range: &ScanRange) -> Result<ScannedRows> {
        scan_table(lookup(&self.tables, &table.name)?, table, range)
    }
}

/// Live target session.
struct MemTarget {
    db: MemDatabase,
    faults: Arc<Faults>,
    counters: Arc<Counters>,
}

impl MemTarget {
    fn table(&self, name: &str) -> Result<MemTable> {
        let tables = self.db.tables.lock().unwrap();
        let table = lookup(&tables, name)?.clone();
        Ok(table)
    }
}

#[async_trait]
impl TableReader for MemTarget {
    async fn list_tables(&self, _schema: &str) -> Result<Vec<String>> {
        Ok(self.db.tables.lock().unwrap().keys().cloned().collect())
    }

    async fn list_columns(&self, _schema: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        Ok(self.table(table)?.columns)
    }

    async fn primary_key(&self, _schema: &str, table: &str) -> Result<PrimaryKey> {
        primary_key_of(&self.table(table)?)
    }

    async fn key_bounds(&self, table: &TableDescriptor) -> Result<Option<(i64, i64)>> {
        key_bounds_of(&self.table(&table.name)?)
    }

    async fn scan(&self, table: &TableDescriptor, range: &ScanRange) -> Result<ScannedRows> {
        scan_table(&self.table(&table.name)?, table, range)
    }
}

#[async_trait]
impl ChangeApplier for MemTarget {
    async fn apply_changes(
        &self,
        table: &TableDescriptor,
        changes: &ChangeSet,
        source: &ScannedRows,
        target: &ScannedRows,
        policy: DeletePolicy,
    ) -> Result<ApplyOutcome> {
        self.counters.apply_calls.fetch_add(1, AtomicOrdering::SeqCst);

        if let Some(bad_keys) = self.faults.apply_keys.lock().unwrap().get(&table.name) {
            let touched = changes
                .upserts()
                .chain(changes.delete.iter())
                .any(|key| bad_keys.contains(&key.to_string()));
            if touched {
                bail!("deadlock detected");
            }
        }
        let delete_fails = !changes.delete.is_empty()
            && self
                .faults
                .delete_tables
                .lock()
                .unwrap()
                .contains(&table.name);
        if delete_fails && policy == DeletePolicy::Atomic {
            bail!("update or delete violates foreign key constraint");
        }

        let mut tables = self.db.tables.lock().unwrap();
        let mem = tables
            .get_mut(&table.name)
            .ok_or_else(|| anyhow!("relation {} does not exist", table.name))?;

        let mut outcome = ApplyOutcome::default();
        // Keyless rows are matched by content, so the stale copy goes first.
        let deletes_first = matches!(table.identity, RowIdentity::WholeRow);
        if deletes_first {
            delete_from(mem, table, changes, target, delete_fails, &mut outcome)?;
        }
        for key in changes.upserts() {
            let row = source
                .get(key)
                .ok_or_else(|| anyhow!("no source row for {}", key))?;
            match table.identity {
                RowIdentity::PrimaryKey(_) => mem.upsert(row.values.clone()),
                RowIdentity::WholeRow => mem.insert_plain(row.values.clone())?,
            }
            outcome.upserted += 1;
        }
        if !deletes_first {
            delete_from(mem, table, changes, target, delete_fails, &mut outcome)?;
        }

        Ok(outcome)
    }

    async fn drop_table(&self, _schema: &str, table: &str) -> Result<()> {
        if self.faults.undroppable.lock().unwrap().contains(table) {
            bail!("cannot drop table {} because other objects depend on it", table);
        }
        self.db.tables.lock().unwrap().remove(table);
        Ok(())
    }
}

fn delete_from(
    mem: &mut MemTable,
    table: &TableDescriptor,
    changes: &ChangeSet,
    target: &ScannedRows,
    delete_fails: bool,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    if delete_fails {
        outcome.delete_skipped = true;
        return Ok(());
    }

    for key in &changes.delete {
        let before = mem.rows.len();
        match &table.identity {
            RowIdentity::PrimaryKey(_) => {
                let parts = key.parts().to_vec();
                let filtered: Vec<_> = mem
                    .rows
                    .iter()
                    .filter(|(_, row)| mem.key_of(row) != parts)
                    .cloned()
                    .collect();
                mem.rows = filtered;
            }
            RowIdentity::WholeRow => {
                let locator = target
                    .get(key)
                    .and_then(|row| row.locator.clone())
                    .ok_or_else(|| anyhow!("no locator for {}", key))?;
                mem.rows.retain(|(id, _)| id.to_string() != locator);
            }
        }
        outcome.deleted += (before - mem.rows.len()) as u64;
    }
    Ok(())
}

fn lookup<'a>(tables: &'a BTreeMap<String, MemTable>, name: &str) -> Result<&'a MemTable> {
    tables
        .get(name)
        .ok_or_else(|| anyhow!("relation {} does not exist", name))
}

fn primary_key_of(table: &MemTable) -> Result<PrimaryKey> {
    let key_columns: Vec<&ColumnInfo> = table
        .key_indexes()
        .into_iter()
        .map(|i| &table.columns[i])
        .collect();
    Ok(PrimaryKey {
        single_numeric: key_columns.len() == 1 && key_columns[0].is_integer(),
        columns: table.primary_key.clone(),
    })
}

fn key_bounds_of(table: &MemTable) -> Result<Option<(i64, i64)>> {
    let idx = match table.key_indexes().as_slice() {
        [idx] => *idx,
        _ => bail!("no single-column key"),
    };
    let keys: Vec<i64> = table
        .rows
        .iter()
        .filter_map(|(_, row)| row[idx].as_deref().and_then(|s| s.parse().ok()))
        .collect();
    Ok(keys.iter().min().copied().zip(keys.iter().max().copied()))
}

fn compare_keys(a: &[String], b: &[String]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        let ord = match (x.parse::<i64>(), y.parse::<i64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn scan_table(
    table: &MemTable,
    descriptor: &TableDescriptor,
    range: &ScanRange,
) -> Result<ScannedRows> {
    let position = |name: &str| {
        table
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| anyhow!("column {} does not exist", name))
    };
    let projection = descriptor
        .columns
        .iter()
        .map(|c| position(&c.name))
        .collect::<Result<Vec<_>>>()?;

    let mut rows: Vec<&(u64, Vec<Value>)> = match range {
        ScanRange::All => table.rows.iter().collect(),
        ScanRange::KeyRange { lo, hi } => {
            let idx = descriptor.key_indexes()[0];
            table
                .rows
                .iter()
                .filter(|(_, row)| {
                    row[idx]
                        .as_deref()
                        .and_then(|s| s.parse::<i64>().ok())
                        .map(|k| *lo <= k && k <= *hi)
                        .unwrap_or(false)
                })
                .collect()
        }
        ScanRange::ModifiedSince {
            column,
            since,
            after,
            limit,
        } => {
            let ts = position(column)?;
            let mut matching: Vec<_> = table
                .rows
                .iter()
                .filter(|(_, row)| {
                    row[ts]
                        .as_deref()
                        .and_then(|s| NaiveDateTime::parse_from_str(s, WATERMARK_FORMAT).ok())
                        .map(|t| t > *since)
                        .unwrap_or(false)
                })
                .filter(|(_, row)| match after {
                    Some(cursor) => {
                        compare_keys(&table.key_of(row), cursor.parts()) == Ordering::Greater
                    }
                    None => true,
                })
                .collect();
            matching.sort_by(|a, b| compare_keys(&table.key_of(&a.1), &table.key_of(&b.1)));
            matching.truncate(*limit);
            matching
        }
        ScanRange::Keys(keys) => {
            let wanted: HashSet<&RowKey> = keys.iter().collect();
            table
                .rows
                .iter()
                .filter(|(_, row)| wanted.contains(&RowKey::new(table.key_of(row))))
                .collect()
        }
    };

    // Mimic a heap scan: no particular order unless one was asked for
    if !matches!(range, ScanRange::ModifiedSince { .. }) {
        rows.reverse();
    }

    let mut collector = RowCollector::new(descriptor);
    for (id, values) in rows {
        let projected = projection.iter().map(|&i| values[i].clone()).collect();
        let locator = if descriptor.has_primary_key() {
            None
        } else {
            Some(id.to_string())
        };
        collector.push(projected, locator)?;
    }
    Ok(collector.finish())
}
