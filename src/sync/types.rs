// ABOUTME: Table and row descriptors shared by every stage of a sync run
// ABOUTME: Describes columns, row identity, row keys, and the ranges a scan can cover

use anyhow::{bail, Result};
use chrono::NaiveDateTime;
use std::fmt;

/// A column value as rendered by the server. `None` is SQL NULL.
///
/// Values are never interpreted by the engine: they are hashed, compared and
/// written back verbatim through a cast to the column's declared type.
pub type Value = Option<String>;

/// A column name paired with its declared SQL type (as `format_type` prints it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }

    /// True for the integer types a chunked key range can be built over.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.data_type.as_str(),
            "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8"
        )
    }
}

/// Primary key shape as reported by the catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrimaryKey {
    pub columns: Vec<String>,
    /// The key is exactly one column of an integer type.
    pub single_numeric: bool,
}

impl PrimaryKey {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// How rows of a table are told apart across the two databases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowIdentity {
    /// Rows are keyed by their primary-key columns.
    PrimaryKey(Vec<String>),
    /// Keyless table: a row is identified by its content plus an occurrence
    /// ordinal, and located on the target by its physical row id.
    WholeRow,
}

/// Everything the scanner and applier need to know about one table.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub identity: RowIdentity,
    key_indexes: Vec<usize>,
}

impl TableDescriptor {
    pub fn new(
        schema: impl Into<String>,
        name: impl Into<String>,
        columns: Vec<ColumnInfo>,
        identity: RowIdentity,
    ) -> Result<Self> {
        let schema = schema.into();
        let name = name.into();

        let mut key_indexes = Vec::new();
        if let RowIdentity::PrimaryKey(keys) = &identity {
            if keys.is_empty() {
                bail!("{}.{}: primary key identity without key columns", schema, name);
            }
            for key in keys {
                match columns.iter().position(|c| &c.name == key) {
                    Some(idx) => key_indexes.push(idx),
                    None => bail!(
                        "{}.{}: primary key column '{}' is not among the table columns",
                        schema,
                        name,
                        key
                    ),
                }
            }
        }

        Ok(Self {
            schema,
            name,
            columns,
            identity,
            key_indexes,
        })
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Key columns in key order. Empty for keyless tables.
    pub fn key_columns(&self) -> Vec<&ColumnInfo> {
        self.key_indexes.iter().map(|&i| &self.columns[i]).collect()
    }

    /// Positions of the key columns within a scanned row.
    pub fn key_indexes(&self) -> &[usize] {
        &self.key_indexes
    }

    pub fn has_primary_key(&self) -> bool {
        matches!(self.identity, RowIdentity::PrimaryKey(_))
    }
}

/// Rendered primary-key value of a row. One part per key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(Vec<String>);

impl RowKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn single(value: impl Into<String>) -> Self {
        Self(vec![value.into()])
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() == 1 {
            return f.write_str(&self.0[0]);
        }
        write!(f, "({})", self.0.join(", "))
    }
}

impl From<i64> for RowKey {
    fn from(value: i64) -> Self {
        RowKey::single(value.to_string())
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        RowKey::single(value)
    }
}

/// The slice of a table a single scan covers.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanRange {
    /// Every row of the table.
    All,
    /// Rows whose single integer key lies in `lo..=hi`.
    KeyRange { lo: i64, hi: i64 },
    /// One page of rows modified after `since`, in key order, starting after
    /// the key `after`.
    ModifiedSince {
        column: String,
        since: NaiveDateTime,
        after: Option<RowKey>,
        limit: usize,
    },
    /// Rows with exactly these keys.
    Keys(Vec<RowKey>),
}

impl fmt::Display for ScanRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanRange::All => f.write_str("[all]"),
            ScanRange::KeyRange { lo, hi } => write!(f, "[{}..{}]", lo, hi),
            ScanRange::ModifiedSince {
                column,
                since,
                after,
                ..
            } => match after {
                Some(key) => write!(f, "[{} > {}, key > {}]", column, since, key),
                None => write!(f, "[{} > {}]", column, since),
            },
            ScanRange::Keys(keys) => write!(f, "[{} keys]", keys.len()),
        }
    }
}
