// ABOUTME: Row fingerprinting - digests rendered column values for cheap equality checks
// ABOUTME: Collects scanned rows into key -> (fingerprint, values) maps for one side of a chunk

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

use super::types::{RowIdentity, RowKey, TableDescriptor, Value};

const NULL_TAG: u8 = 0;
const VALUE_TAG: u8 = 1;

/// SHA-256 digest of a row's column values.
///
/// Each column is framed as a tag byte followed, for non-NULL values, by the
/// little-endian byte length and the bytes themselves. Two rows only share a
/// fingerprint when every column renders identically, including where one
/// value ends and the next begins.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of_row(values: &[Value]) -> Self {
        let mut hasher = Sha256::new();
        for value in values {
            match value {
                None => hasher.update([NULL_TAG]),
                Some(text) => {
                    hasher.update([VALUE_TAG]);
                    hasher.update((text.len() as u64).to_le_bytes());
                    hasher.update(text.as_bytes());
                }
            }
        }
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

/// One scanned row: its digest, its raw values, and (keyless tables only)
/// where it physically lives.
#[derive(Debug, Clone)]
pub struct ScannedRow {
    pub fingerprint: Fingerprint,
    pub values: Vec<Value>,
    pub locator: Option<String>,
}

/// All rows one side returned for one scan, keyed by rendered row key.
#[derive(Debug, Clone, Default)]
pub struct ScannedRows {
    rows: HashMap<RowKey, ScannedRow>,
    last_key: Option<RowKey>,
}

impl ScannedRows {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &RowKey) -> Option<&ScannedRow> {
        self.rows.get(key)
    }

    pub fn fingerprint(&self, key: &RowKey) -> Option<Fingerprint> {
        self.rows.get(key).map(|row| row.fingerprint)
    }

    pub fn contains(&self, key: &RowKey) -> bool {
        self.rows.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> {
        self.rows.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RowKey, &ScannedRow)> {
        self.rows.iter()
    }

    /// Key of the last row in the order the database returned them.
    pub fn last_key(&self) -> Option<&RowKey> {
        self.last_key.as_ref()
    }

    /// Merge another scan of the same table into this one.
    pub fn extend(&mut self, other: ScannedRows) {
        if other.last_key.is_some() {
            self.last_key = other.last_key;
        }
        self.rows.extend(other.rows);
    }
}

/// Builds [`ScannedRows`] from raw result rows in the order they arrive.
pub struct RowCollector<'a> {
    table: &'a TableDescriptor,
    rows: ScannedRows,
    occurrences: HashMap<Fingerprint, usize>,
}

impl<'a> RowCollector<'a> {
    pub fn new(table: &'a TableDescriptor) -> Self {
        Self {
            table,
            rows: ScannedRows::new(),
            occurrences: HashMap::new(),
        }
    }

    /// Fingerprint a row and file it under its key.
    ///
    /// `values` must hold every table column in descriptor order.
    pub fn push(&mut self, values: Vec<Value>, locator: Option<String>) -> Result<()> {
        if values.len() != self.table.columns.len() {
            bail!(
                "{}: scanned row has {} values, expected {}",
                self.table.qualified_name(),
                values.len(),
                self.table.columns.len()
            );
        }

        let fingerprint = Fingerprint::of_row(&values);
        let key = match &self.table.identity {
            RowIdentity::PrimaryKey(_) => {
                let mut parts = Vec::with_capacity(self.table.key_indexes().len());
                for &idx in self.table.key_indexes() {
                    match &values[idx] {
                        Some(text) => parts.push(text.clone()),
                        None => bail!(
                            "{}: NULL in primary key column '{}'",
                            self.table.qualified_name(),
                            self.table.columns[idx].name
                        ),
                    }
                }
                RowKey::new(parts)
            }
            RowIdentity::WholeRow => {
                let seen = self.occurrences.entry(fingerprint).or_insert(0);
                let key = RowKey::new(vec![fingerprint.to_string(), seen.to_string()]);
                *seen += 1;
                key
            }
        };

        self.rows.last_key = Some(key.clone());
        self.rows.rows.insert(
            key,
            ScannedRow {
                fingerprint,
                values,
                locator,
            },
        );
        Ok(())
    }

    pub fn finish(self) -> ScannedRows {
        self.rows
    }
}
