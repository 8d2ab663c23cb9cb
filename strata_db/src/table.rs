//! Tables: row allocation, version chains, and index maintenance.
//!
//! A table owns its page ranges, the indirection map from RID to the head
//! of each row's version chain, the index registry, and the RID counter.
//! The record-level operations here assume the caller already holds the
//! appropriate record locks; lock acquisition lives in the transaction
//! layer. Structural growth (new page ranges) and insert uniqueness are
//! serialized by table-level latches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use groundwork::buffer_pool::BufferPool;
use groundwork::lock_manager::{LockManager, LockMode, TxnId};
use groundwork::page_range::PageRange;
use groundwork::rid::{self, Rid};
use groundwork::{INDIRECTION_COLUMN, RID_DELETED, SCHEMA_ENCODING_COLUMN, TableId};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::errors::{DbError, Result};
use crate::index::Index;

/// A materialized row: the projected columns in ascending column order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<i64>,
}

/// What an aborted update must put back.
pub(crate) struct UpdateUndo {
    pub(crate) rid: Rid,
    pub(crate) old_indirection: u64,
    pub(crate) old_schema: u64,
    /// Reversed index maintenance: (column, old value, new value).
    pub(crate) index_changes: Vec<(usize, i64, i64)>,
}

/// What an aborted delete must put back.
pub(crate) struct DeleteUndo {
    pub(crate) rid: Rid,
    pub(crate) old_indirection: u64,
    pub(crate) old_schema: u64,
    /// The latest row image at delete time, for index restoration.
    pub(crate) row: Vec<i64>,
}

/// One table of fixed-arity integer rows.
pub struct Table {
    name: String,
    id: TableId,
    num_columns: usize,
    key_column: usize,
    next_rid: AtomicU64,
    ranges: RwLock<Vec<Arc<PageRange>>>,
    indirection: RwLock<HashMap<Rid, u64>>,
    index: Index,
    insert_latch: Mutex<()>,
    pool: Arc<BufferPool>,
    locks: Arc<LockManager>,
    txn_ids: Arc<AtomicU64>,
    poisoned: Arc<AtomicBool>,
}

fn now_seconds() -> u64 {
    Utc::now().timestamp().max(0) as u64
}

impl Table {
    pub(crate) fn new(
        name: String,
        id: TableId,
        num_columns: usize,
        key_column: usize,
        pool: Arc<BufferPool>,
        locks: Arc<LockManager>,
        txn_ids: Arc<AtomicU64>,
        poisoned: Arc<AtomicBool>,
    ) -> Self {
        Table {
            name,
            id,
            num_columns,
            key_column,
            next_rid: AtomicU64::new(0),
            ranges: RwLock::new(Vec::new()),
            indirection: RwLock::new(HashMap::new()),
            index: Index::new(num_columns, key_column),
            insert_latch: Mutex::new(()),
            pool,
            locks,
            txn_ids,
            poisoned,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn key_column(&self) -> usize {
        self.key_column
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub(crate) fn index(&self) -> &Index {
        &self.index
    }

    pub(crate) fn next_txn_id(&self) -> TxnId {
        self.txn_ids.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
    }

    // ---- catalog restoration, used by Database::open ----

    pub(crate) fn set_next_rid(&self, next_rid: u64) {
        self.next_rid.store(next_rid, Ordering::SeqCst);
    }

    pub(crate) fn next_rid_value(&self) -> u64 {
        self.next_rid.load(Ordering::SeqCst)
    }

    pub(crate) fn install_range(&self, range: Arc<PageRange>) {
        self.ranges.write().push(range);
    }

    pub(crate) fn range_count(&self) -> usize {
        self.ranges.read().len()
    }

    pub(crate) fn load_indirection(&self, entries: impl IntoIterator<Item = (Rid, u64)>) {
        self.indirection.write().extend(entries);
    }

    pub(crate) fn indirection_snapshot(&self) -> Vec<(Rid, u64)> {
        let map = self.indirection.read();
        let mut entries: Vec<(Rid, u64)> = map.iter().map(|(&k, &v)| (k, v)).collect();
        entries.sort_unstable_by_key(|&(rid, _)| rid);
        entries
    }

    // ---- addressing ----

    fn indirection_of(&self, rid: Rid) -> u64 {
        self.indirection
            .read()
            .get(&rid)
            .copied()
            .unwrap_or(RID_DELETED)
    }

    fn publish_indirection(&self, rid: Rid, value: u64) -> Result<()> {
        // Tail data is fully written before this point; the map entry and
        // the base metadata column are the publication.
        self.indirection.write().insert(rid, value);
        let range = self.range_for(rid)?;
        range.overwrite_base_meta(&self.pool, rid, INDIRECTION_COLUMN, value)?;
        Ok(())
    }

    fn range_for(&self, rid: Rid) -> Result<Arc<PageRange>> {
        self.ranges
            .read()
            .get(rid::rid_range_id(rid) as usize)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    /// Returns the range holding `range_id`, growing the table as needed.
    fn ensure_range(&self, range_id: u32) -> Arc<PageRange> {
        {
            let ranges = self.ranges.read();
            if let Some(range) = ranges.get(range_id as usize) {
                return range.clone();
            }
        }
        let mut ranges = self.ranges.write();
        while ranges.len() <= range_id as usize {
            let next = ranges.len() as u32;
            debug!(table = %self.name, range = next, "allocating page range");
            ranges.push(Arc::new(PageRange::new(self.id, next, self.num_columns)));
        }
        ranges[range_id as usize].clone()
    }

    // ---- lookups ----

    pub fn locate(&self, column: usize, value: i64) -> Vec<Rid> {
        self.index.locate(column, value)
    }

    pub(crate) fn locate_key_range(&self, lo: i64, hi: i64) -> Vec<Rid> {
        self.index.locate_range(self.key_column, lo, hi)
    }

    // ---- record operations (record locks are the caller's business) ----

    /// Inserts a row, returning its RID. Takes the insert latch so the
    /// uniqueness check, RID allocation, and index install are atomic with
    /// respect to other inserts, and X-locks the fresh RID for the caller's
    /// transaction before any data is written.
    pub(crate) fn insert_row(&self, txn: TxnId, values: &[i64]) -> Result<Rid> {
        if values.len() != self.num_columns {
            return Err(DbError::SchemaMismatch(format!(
                "insert arity {} into {}-column table",
                values.len(),
                self.num_columns
            )));
        }

        let _latch = self.insert_latch.lock();
        let key = values[self.key_column];
        if !self.index.locate(self.key_column, key).is_empty() {
            return Err(DbError::DuplicateKey);
        }

        let rid = self.next_rid.fetch_add(1, Ordering::SeqCst);
        self.locks
            .try_acquire(txn, self.id, rid, LockMode::Exclusive)?;

        let range = self.ensure_range(rid::rid_range_id(rid));
        range.write_base_record(&self.pool, rid, values, now_seconds())?;
        self.indirection.write().insert(rid, 0);

        self.index.insert_entry(self.key_column, key, rid);
        for column in self.index.secondary_columns() {
            self.index.insert_entry(column, values[column], rid);
        }
        Ok(rid)
    }

    /// Reads the projected columns of a row, `steps_back` versions behind
    /// the latest. `None` when the row is deleted.
    pub(crate) fn read_row(
        &self,
        rid: Rid,
        projection: &[bool],
        steps_back: usize,
    ) -> Result<Option<Vec<i64>>> {
        if projection.len() != self.num_columns {
            return Err(DbError::SchemaMismatch(format!(
                "projection arity {} against {}-column table",
                projection.len(),
                self.num_columns
            )));
        }
        let head = self.indirection_of(rid);
        if rid::is_deleted(head) {
            return Ok(None);
        }
        let range = self.range_for(rid)?;
        let start = range.rewind_chain(&self.pool, head, steps_back)?;
        Ok(Some(range.reconstruct(&self.pool, rid, start, projection)?))
    }

    /// Reads the current primary key of a row.
    pub(crate) fn read_key(&self, rid: Rid) -> Result<Option<i64>> {
        let mut projection = vec![false; self.num_columns];
        projection[self.key_column] = true;
        Ok(self.read_row(rid, &projection, 0)?.map(|row| row[0]))
    }

    /// Appends a tail record for `diff` and republishes the indirection.
    /// Maintains the primary index on key changes (failing with
    /// `DuplicateKey` on collision) and any secondary indexes on changed
    /// indexed columns.
    pub(crate) fn append_update(&self, rid: Rid, diff: &[Option<i64>]) -> Result<UpdateUndo> {
        if diff.len() != self.num_columns {
            return Err(DbError::SchemaMismatch(format!(
                "update arity {} against {}-column table",
                diff.len(),
                self.num_columns
            )));
        }

        let old_indirection = self.indirection_of(rid);
        if rid::is_deleted(old_indirection) {
            return Err(DbError::NotFound);
        }
        let range = self.range_for(rid)?;
        let old_schema = range.read_base_meta(&self.pool, rid, SCHEMA_ENCODING_COLUMN)?;

        // Pre-images of the columns whose index entries may move.
        let mut interesting = vec![false; self.num_columns];
        let mut any_interesting = false;
        for (column, value) in diff.iter().enumerate() {
            if value.is_some() && (column == self.key_column || self.index.has_index(column)) {
                interesting[column] = true;
                any_interesting = true;
            }
        }
        let mut old_values: HashMap<usize, i64> = HashMap::new();
        if any_interesting {
            let values = range.reconstruct(&self.pool, rid, old_indirection, &interesting)?;
            let mut it = values.into_iter();
            for (column, wanted) in interesting.iter().enumerate() {
                if *wanted {
                    old_values.insert(column, it.next().expect("projection arity"));
                }
            }
        }

        let mut index_changes = Vec::new();
        if let Some(new_key) = diff[self.key_column] {
            let old_key = old_values[&self.key_column];
            if new_key != old_key {
                // Serialize re-keying against concurrent inserts.
                let _latch = self.insert_latch.lock();
                if !self.index.locate(self.key_column, new_key).is_empty() {
                    return Err(DbError::DuplicateKey);
                }
                self.index.remove_entry(self.key_column, old_key, rid);
                self.index.insert_entry(self.key_column, new_key, rid);
                index_changes.push((self.key_column, old_key, new_key));
            }
        }
        for column in self.index.secondary_columns() {
            if let Some(new_value) = diff[column] {
                let old_value = old_values[&column];
                if new_value != old_value {
                    self.index.remove_entry(column, old_value, rid);
                    self.index.insert_entry(column, new_value, rid);
                    index_changes.push((column, old_value, new_value));
                }
            }
        }

        let tid = range.append_tail_record(&self.pool, old_indirection, diff, now_seconds())?;
        self.publish_indirection(rid, tid)?;
        let mask = groundwork::page_range::schema_mask(diff);
        range.overwrite_base_meta(&self.pool, rid, SCHEMA_ENCODING_COLUMN, old_schema | mask)?;

        Ok(UpdateUndo {
            rid,
            old_indirection,
            old_schema,
            index_changes,
        })
    }

    /// Marks a row deleted and removes it from every index. The base slot
    /// and tail chain stay on disk; only the indirection changes.
    pub(crate) fn mark_deleted(&self, rid: Rid) -> Result<DeleteUndo> {
        let old_indirection = self.indirection_of(rid);
        if rid::is_deleted(old_indirection) {
            return Err(DbError::NotFound);
        }
        let range = self.range_for(rid)?;
        let old_schema = range.read_base_meta(&self.pool, rid, SCHEMA_ENCODING_COLUMN)?;
        let all = vec![true; self.num_columns];
        let row = range.reconstruct(&self.pool, rid, old_indirection, &all)?;

        self.publish_indirection(rid, RID_DELETED)?;
        self.index
            .remove_entry(self.key_column, row[self.key_column], rid);
        for column in self.index.secondary_columns() {
            self.index.remove_entry(column, row[column], rid);
        }

        Ok(DeleteUndo {
            rid,
            old_indirection,
            old_schema,
            row,
        })
    }

    // ---- rollback primitives ----

    pub(crate) fn undo_update(&self, undo: &UpdateUndo) -> Result<()> {
        self.publish_indirection(undo.rid, undo.old_indirection)?;
        let range = self.range_for(undo.rid)?;
        range.overwrite_base_meta(
            &self.pool,
            undo.rid,
            SCHEMA_ENCODING_COLUMN,
            undo.old_schema,
        )?;
        for &(column, old_value, new_value) in undo.index_changes.iter().rev() {
            self.index.remove_entry(column, new_value, undo.rid);
            self.index.insert_entry(column, old_value, undo.rid);
        }
        Ok(())
    }

    pub(crate) fn undo_delete(&self, undo: &DeleteUndo) -> Result<()> {
        self.publish_indirection(undo.rid, undo.old_indirection)?;
        let range = self.range_for(undo.rid)?;
        range.overwrite_base_meta(
            &self.pool,
            undo.rid,
            SCHEMA_ENCODING_COLUMN,
            undo.old_schema,
        )?;
        self.index
            .insert_entry(self.key_column, undo.row[self.key_column], undo.rid);
        for column in self.index.secondary_columns() {
            self.index.insert_entry(column, undo.row[column], undo.rid);
        }
        Ok(())
    }

    /// Retracts an aborted insert: the RID is burned, the slot marked
    /// deleted, the index entries removed.
    pub(crate) fn retract_insert(&self, rid: Rid, values: &[i64]) -> Result<()> {
        self.publish_indirection(rid, RID_DELETED)?;
        self.index
            .remove_entry(self.key_column, values[self.key_column], rid);
        for column in self.index.secondary_columns() {
            self.index.remove_entry(column, values[column], rid);
        }
        Ok(())
    }

    // ---- secondary indexes ----

    /// Builds a secondary index over the latest version of every live row.
    /// Returns false when the column is out of range or already indexed.
    /// Not safe against concurrent writers; callers quiesce first.
    pub fn create_index(&self, column: usize) -> Result<bool> {
        if !self.index.create_index(column) {
            return Ok(false);
        }
        let mut projection = vec![false; self.num_columns];
        projection[column] = true;
        for (_, rid) in self.index.primary_entries() {
            if let Some(row) = self.read_row(rid, &projection, 0)? {
                self.index.insert_entry(column, row[0], rid);
            }
        }
        Ok(true)
    }

    pub fn drop_index(&self, column: usize) -> bool {
        self.index.drop_index(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundwork::page_store::PageStore;
    use groundwork::RECORDS_PER_RANGE;
    use tempfile::tempdir;

    fn table(num_columns: usize, key_column: usize) -> (tempfile::TempDir, Table) {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path());
        store.register_table(1, "t");
        let pool = Arc::new(BufferPool::new(store, 128));
        let table = Table::new(
            "t".to_string(),
            1,
            num_columns,
            key_column,
            pool,
            Arc::new(LockManager::new()),
            Arc::new(AtomicU64::new(1)),
            Arc::new(AtomicBool::new(false)),
        );
        (dir, table)
    }

    #[test]
    fn insert_then_read_round_trips() {
        let (_dir, table) = table(3, 0);
        let rid = table.insert_row(1, &[1, 10, 20]).unwrap();
        assert_eq!(rid, 0);

        let row = table.read_row(rid, &[true, true, true], 0).unwrap();
        assert_eq!(row, Some(vec![1, 10, 20]));
        assert_eq!(table.locate(0, 1), vec![rid]);
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let (_dir, table) = table(2, 0);
        table.insert_row(1, &[5, 50]).unwrap();
        assert!(matches!(
            table.insert_row(1, &[5, 99]),
            Err(DbError::DuplicateKey)
        ));
    }

    #[test]
    fn wrong_arity_is_rejected() {
        let (_dir, table) = table(3, 0);
        assert!(matches!(
            table.insert_row(1, &[1, 2]),
            Err(DbError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn updates_stack_into_versions() {
        let (_dir, table) = table(4, 0);
        let rid = table.insert_row(1, &[1, 10, 20, 30]).unwrap();
        table
            .append_update(rid, &[None, Some(11), None, None])
            .unwrap();
        table
            .append_update(rid, &[None, None, Some(22), None])
            .unwrap();

        let all = [true, true, true, true];
        assert_eq!(
            table.read_row(rid, &all, 0).unwrap(),
            Some(vec![1, 11, 22, 30])
        );
        assert_eq!(
            table.read_row(rid, &all, 1).unwrap(),
            Some(vec![1, 11, 20, 30])
        );
        assert_eq!(
            table.read_row(rid, &all, 2).unwrap(),
            Some(vec![1, 10, 20, 30])
        );
        // Past the chain end the base image keeps answering.
        assert_eq!(
            table.read_row(rid, &all, 9).unwrap(),
            Some(vec![1, 10, 20, 30])
        );
    }

    #[test]
    fn delete_hides_the_row_and_undo_restores_it() {
        let (_dir, table) = table(2, 0);
        let rid = table.insert_row(1, &[7, 70]).unwrap();
        table.append_update(rid, &[None, Some(71)]).unwrap();

        let undo = table.mark_deleted(rid).unwrap();
        assert_eq!(table.read_row(rid, &[true, true], 0).unwrap(), None);
        assert!(table.locate(0, 7).is_empty());

        table.undo_delete(&undo).unwrap();
        assert_eq!(
            table.read_row(rid, &[true, true], 0).unwrap(),
            Some(vec![7, 71])
        );
        assert_eq!(table.locate(0, 7), vec![rid]);
    }

    #[test]
    fn update_undo_restores_the_previous_version() {
        let (_dir, table) = table(2, 0);
        let rid = table.insert_row(1, &[3, 30]).unwrap();
        table.append_update(rid, &[None, Some(31)]).unwrap();
        let undo = table.append_update(rid, &[None, Some(32)]).unwrap();

        table.undo_update(&undo).unwrap();
        assert_eq!(
            table.read_row(rid, &[true, true], 0).unwrap(),
            Some(vec![3, 31])
        );
    }

    #[test]
    fn primary_key_update_rekeys_the_index() {
        let (_dir, table) = table(2, 0);
        let rid = table.insert_row(1, &[1, 10]).unwrap();
        table.insert_row(1, &[2, 20]).unwrap();

        // Colliding key change fails.
        assert!(matches!(
            table.append_update(rid, &[Some(2), None]),
            Err(DbError::DuplicateKey)
        ));

        let undo = table.append_update(rid, &[Some(9), None]).unwrap();
        assert!(table.locate(0, 1).is_empty());
        assert_eq!(table.locate(0, 9), vec![rid]);

        table.undo_update(&undo).unwrap();
        assert_eq!(table.locate(0, 1), vec![rid]);
        assert!(table.locate(0, 9).is_empty());
    }

    #[test]
    fn retracted_insert_disappears() {
        let (_dir, table) = table(2, 0);
        let values = [4, 40];
        let rid = table.insert_row(1, &values).unwrap();
        table.retract_insert(rid, &values).unwrap();

        assert_eq!(table.read_row(rid, &[true, true], 0).unwrap(), None);
        assert!(table.locate(0, 4).is_empty());
        // The RID is burned; the next insert gets a fresh one.
        assert_eq!(table.insert_row(1, &[4, 40]).unwrap(), rid + 1);
    }

    #[test]
    fn secondary_index_tracks_latest_values() {
        let (_dir, table) = table(3, 0);
        for key in 0..4 {
            table.insert_row(1, &[key, key * 10, 0]).unwrap();
        }
        let rid = table.locate(0, 2)[0];
        table.append_update(rid, &[None, Some(99), None]).unwrap();

        table.create_index(1).unwrap();
        assert_eq!(table.locate(1, 99), vec![rid]);
        assert!(table.locate(1, 20).is_empty());

        // Maintained on later updates too.
        table.append_update(rid, &[None, Some(77), None]).unwrap();
        assert_eq!(table.locate(1, 77), vec![rid]);
        assert!(table.locate(1, 99).is_empty());
    }

    #[test]
    fn inserts_cross_into_a_second_page_range() {
        let (_dir, table) = table(2, 0);
        for key in 0..(RECORDS_PER_RANGE as i64 + 2) {
            table.insert_row(1, &[key, key]).unwrap();
        }
        assert_eq!(table.range_count(), 2);

        let rid = table.locate(0, RECORDS_PER_RANGE as i64)[0];
        assert_eq!(rid::rid_range_id(rid), 1);
        assert_eq!(
            table.read_row(rid, &[true, true], 0).unwrap(),
            Some(vec![RECORDS_PER_RANGE as i64, RECORDS_PER_RANGE as i64])
        );
    }
}
