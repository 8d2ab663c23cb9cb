//! Primary and secondary indexes.
//!
//! A thin façade over ordered maps from column value to RIDs. The primary
//! key column is always indexed and unique; any other column can carry an
//! optional secondary index holding one entry per matching row. Secondary
//! indexes are built on demand and are not maintained under concurrent
//! writers; callers rebuild them when that matters.

use std::collections::BTreeMap;

use groundwork::Rid;
use parking_lot::RwLock;

type ColumnIndex = BTreeMap<i64, Vec<Rid>>;

/// The per-table index registry.
pub struct Index {
    key_column: usize,
    columns: RwLock<Vec<Option<ColumnIndex>>>,
}

impl Index {
    pub fn new(num_columns: usize, key_column: usize) -> Self {
        let mut columns: Vec<Option<ColumnIndex>> = (0..num_columns).map(|_| None).collect();
        columns[key_column] = Some(BTreeMap::new());
        Index {
            key_column,
            columns: RwLock::new(columns),
        }
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    pub fn has_index(&self, column: usize) -> bool {
        self.columns
            .read()
            .get(column)
            .map_or(false, Option::is_some)
    }

    /// Secondary columns currently indexed, for catalog persistence.
    pub fn secondary_columns(&self) -> Vec<usize> {
        self.columns
            .read()
            .iter()
            .enumerate()
            .filter(|(column, slot)| *column != self.key_column && slot.is_some())
            .map(|(column, _)| column)
            .collect()
    }

    /// RIDs of records whose indexed column equals `value`. Empty when the
    /// column is not indexed or no record matches.
    pub fn locate(&self, column: usize, value: i64) -> Vec<Rid> {
        let columns = self.columns.read();
        match columns.get(column).and_then(Option::as_ref) {
            Some(map) => map.get(&value).cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// RIDs of records whose indexed column falls in `[lo, hi]`, in value
    /// order. An inverted range is empty, not an error.
    pub fn locate_range(&self, column: usize, lo: i64, hi: i64) -> Vec<Rid> {
        if lo > hi {
            return Vec::new();
        }
        let columns = self.columns.read();
        match columns.get(column).and_then(Option::as_ref) {
            Some(map) => map.range(lo..=hi).flat_map(|(_, rids)| rids.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Adds one entry; a no-op for unindexed columns.
    pub fn insert_entry(&self, column: usize, value: i64, rid: Rid) {
        let mut columns = self.columns.write();
        if let Some(Some(map)) = columns.get_mut(column) {
            map.entry(value).or_default().push(rid);
        }
    }

    /// Removes one entry; a no-op for unindexed columns.
    pub fn remove_entry(&self, column: usize, value: i64, rid: Rid) {
        let mut columns = self.columns.write();
        if let Some(Some(map)) = columns.get_mut(column) {
            let emptied = match map.get_mut(&value) {
                Some(rids) => {
                    rids.retain(|&r| r != rid);
                    rids.is_empty()
                }
                None => false,
            };
            if emptied {
                map.remove(&value);
            }
        }
    }

    /// Installs an empty index on the column. Returns false when the column
    /// is out of range or already indexed; the caller fills the entries.
    pub fn create_index(&self, column: usize) -> bool {
        let mut columns = self.columns.write();
        match columns.get_mut(column) {
            Some(slot @ None) => {
                *slot = Some(BTreeMap::new());
                true
            }
            _ => false,
        }
    }

    /// Drops a secondary index. The primary index cannot be dropped.
    pub fn drop_index(&self, column: usize) -> bool {
        if column == self.key_column {
            return false;
        }
        let mut columns = self.columns.write();
        match columns.get_mut(column) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Snapshot of the primary index, for catalog persistence.
    pub fn primary_entries(&self) -> Vec<(i64, Rid)> {
        let columns = self.columns.read();
        let map = columns[self.key_column]
            .as_ref()
            .expect("primary index always present");
        map.iter()
            .flat_map(|(&key, rids)| rids.iter().map(move |&rid| (key, rid)))
            .collect()
    }
}
