// ABOUTME: Differ - classifies row keys of one chunk as insert, update, or delete
// ABOUTME: Compares source and target fingerprint maps in a single pass over each

use std::collections::BTreeSet;

use super::fingerprint::ScannedRows;
use super::types::RowKey;

/// Keys that must change on the target for one chunk. The three sets are
/// disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub insert: BTreeSet<RowKey>,
    pub update: BTreeSet<RowKey>,
    pub delete: BTreeSet<RowKey>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }

    pub fn total(&self) -> usize {
        self.insert.len() + self.update.len() + self.delete.len()
    }

    /// Keys whose source row gets written (insert and update alike).
    pub fn upserts(&self) -> impl Iterator<Item = &RowKey> {
        self.insert.iter().chain(self.update.iter())
    }

    pub fn upsert_count(&self) -> usize {
        self.insert.len() + self.update.len()
    }
}

/// Compute the change set that turns `target` into `source`.
///
/// Keys present on both sides with equal fingerprints produce no change.
pub fn diff(source: &ScannedRows, target: &ScannedRows) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (key, row) in source.iter() {
        match target.fingerprint(key) {
            None => {
                changes.insert.insert(key.clone());
            }
            Some(existing) if existing != row.fingerprint => {
                changes.update.insert(key.clone());
            }
            Some(_) => {}
        }
    }

    for key in target.keys() {
        if !source.contains(key) {
            changes.delete.insert(key.clone());
        }
    }

    changes
}
