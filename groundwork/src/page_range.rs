//! Base and tail page groups for one contiguous span of records.
//!
//! A page range owns 16 base pages per column (8192 base records) plus an
//! unbounded, append-only run of tail pages per column. Base slots are
//! addressed arithmetically from the RID; tail slots are handed out by a
//! cursor held under the range's tail mutex so concurrent updates never
//! interleave a record across slots.
//!
//! Tail records are non-cumulative: a tail stores only the columns named in
//! its schema-encoding bitmask, its indirection points at the previous tail
//! (or 0 for the first update), and readers walk the chain newest to oldest
//! filling each projected column from the first version that wrote it.

use parking_lot::Mutex;
use tracing::trace;

use crate::buffer_pool::BufferPool;
use crate::error::{Result, StorageError};
use crate::page_store::PageKey;
use crate::rid::{self, Rid, Tid};
use crate::{
    BASE_PAGES_PER_RANGE, INDIRECTION_COLUMN, NUM_METADATA_COLUMNS, RECORDS_PER_PAGE, RID_COLUMN,
    SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN, TableId,
};

/// Allocation cursor over the active tail page.
struct TailCursor {
    /// Tail pages allocated so far, at least one.
    pages: u32,
    /// Slots used in the last tail page.
    used_in_last: u16,
}

/// One range of base records and their tails.
pub struct PageRange {
    table: TableId,
    range_id: u32,
    num_columns: usize,
    tail: Mutex<TailCursor>,
}

impl PageRange {
    pub fn new(table: TableId, range_id: u32, num_columns: usize) -> Self {
        PageRange {
            table,
            range_id,
            num_columns,
            tail: Mutex::new(TailCursor {
                pages: 1,
                used_in_last: 0,
            }),
        }
    }

    /// Rebuilds a range handle for on-disk data, probing the store for the
    /// tail allocation state.
    pub fn recover(
        table: TableId,
        range_id: u32,
        num_columns: usize,
        pool: &BufferPool,
    ) -> Result<Self> {
        let on_disk = pool.store().count_tail_pages(table, range_id);
        let (pages, used_in_last) = if on_disk == 0 {
            (1, 0)
        } else {
            let key = PageKey::tail(table, range_id, 0, on_disk - 1);
            let guard = pool.get_blocking(key)?;
            let used = guard.read().num_records();
            (on_disk, used)
        };
        Ok(PageRange {
            table,
            range_id,
            num_columns,
            tail: Mutex::new(TailCursor {
                pages,
                used_in_last,
            }),
        })
    }

    pub fn range_id(&self) -> u32 {
        self.range_id
    }

    /// Tail pages allocated so far.
    pub fn tail_page_count(&self) -> u32 {
        self.tail.lock().pages
    }

    fn total_columns(&self) -> usize {
        NUM_METADATA_COLUMNS + self.num_columns
    }

    /// Writes a full base record (metadata plus user columns) at the slot
    /// the RID encodes. The caller has already reserved the RID.
    pub fn write_base_record(
        &self,
        pool: &BufferPool,
        rid: Rid,
        values: &[i64],
        timestamp: u64,
    ) -> Result<()> {
        debug_assert_eq!(values.len(), self.num_columns);
        debug_assert_eq!(rid::rid_range_id(rid), self.range_id);
        let page_idx = rid::rid_page_index(rid);
        let slot = rid::rid_slot(rid);
        if page_idx as usize >= BASE_PAGES_PER_RANGE {
            return Err(StorageError::RangeFull);
        }

        for column in 0..self.total_columns() {
            let key = PageKey::base(self.table, self.range_id, column as u16, page_idx);
            let guard = pool.get_blocking(key)?;
            let mut page = guard.write();
            let value = match column {
                INDIRECTION_COLUMN => 0,
                RID_COLUMN => rid,
                TIMESTAMP_COLUMN => timestamp,
                SCHEMA_ENCODING_COLUMN => 0,
                _ => values[column - NUM_METADATA_COLUMNS] as u64,
            };
            let landed = page.append_unsigned(value)?;
            debug_assert_eq!(landed, slot);
        }
        Ok(())
    }

    /// Appends a non-cumulative tail record and returns its TID.
    ///
    /// Only the columns present in `diff` are meaningful; absent columns
    /// get a placeholder to keep the slot aligned across column pages. The
    /// tail's indirection is set to `prev_indirection`, extending the
    /// backward version chain.
    pub fn append_tail_record(
        &self,
        pool: &BufferPool,
        prev_indirection: u64,
        diff: &[Option<i64>],
        timestamp: u64,
    ) -> Result<Tid> {
        debug_assert_eq!(diff.len(), self.num_columns);
        let mut cursor = self.tail.lock();
        if cursor.used_in_last as usize == RECORDS_PER_PAGE {
            cursor.pages += 1;
            cursor.used_in_last = 0;
            trace!(range = self.range_id, pages = cursor.pages, "tail page grown");
        }
        let page_idx = cursor.pages - 1;
        let slot = cursor.used_in_last;
        let tid = rid::compose_tid(self.range_id, page_idx, slot);
        let mask = schema_mask(diff);

        for column in 0..self.total_columns() {
            let key = PageKey::tail(self.table, self.range_id, column as u16, page_idx);
            let guard = pool.get_blocking(key)?;
            let mut page = guard.write();
            let value = match column {
                INDIRECTION_COLUMN => prev_indirection,
                RID_COLUMN => tid,
                TIMESTAMP_COLUMN => timestamp,
                SCHEMA_ENCODING_COLUMN => mask,
                _ => diff[column - NUM_METADATA_COLUMNS].unwrap_or(0) as u64,
            };
            let landed = page.append_unsigned(value)?;
            debug_assert_eq!(landed, slot);
        }

        cursor.used_in_last += 1;
        Ok(tid)
    }

    /// Reads one user column of a base record.
    pub fn read_base_column(&self, pool: &BufferPool, rid: Rid, column: usize) -> Result<i64> {
        let key = PageKey::base(
            self.table,
            self.range_id,
            (NUM_METADATA_COLUMNS + column) as u16,
            rid::rid_page_index(rid),
        );
        let guard = pool.get_blocking(key)?;
        let page = guard.read();
        Ok(page.read(rid::rid_slot(rid)))
    }

    /// Reads one metadata column of a base record.
    pub fn read_base_meta(&self, pool: &BufferPool, rid: Rid, meta: usize) -> Result<u64> {
        debug_assert!(meta < NUM_METADATA_COLUMNS);
        let key = PageKey::base(self.table, self.range_id, meta as u16, rid::rid_page_index(rid));
        let guard = pool.get_blocking(key)?;
        let page = guard.read();
        Ok(page.read_unsigned(rid::rid_slot(rid)))
    }

    /// Overwrites one metadata column of a base record in place. User
    /// columns are never overwritten.
    pub fn overwrite_base_meta(
        &self,
        pool: &BufferPool,
        rid: Rid,
        meta: usize,
        value: u64,
    ) -> Result<()> {
        debug_assert!(meta < NUM_METADATA_COLUMNS);
        let key = PageKey::base(self.table, self.range_id, meta as u16, rid::rid_page_index(rid));
        let guard = pool.get_blocking(key)?;
        guard.write().overwrite(rid::rid_slot(rid), value);
        Ok(())
    }

    /// Reads one user column of a tail record.
    pub fn read_tail_column(&self, pool: &BufferPool, tid: Tid, column: usize) -> Result<i64> {
        let key = PageKey::tail(
            self.table,
            self.range_id,
            (NUM_METADATA_COLUMNS + column) as u16,
            rid::tid_page_index(tid),
        );
        let guard = pool.get_blocking(key)?;
        let page = guard.read();
        Ok(page.read(rid::tid_slot(tid)))
    }

    /// Reads one metadata column of a tail record.
    pub fn read_tail_meta(&self, pool: &BufferPool, tid: Tid, meta: usize) -> Result<u64> {
        debug_assert!(meta < NUM_METADATA_COLUMNS);
        let key = PageKey::tail(self.table, self.range_id, meta as u16, rid::tid_page_index(tid));
        let guard = pool.get_blocking(key)?;
        let page = guard.read();
        Ok(page.read_unsigned(rid::tid_slot(tid)))
    }

    /// Follows the version chain backwards by `steps` links. Returns the
    /// resulting chain head: a TID, or 0 once the walk falls off the end
    /// (which addresses the base record).
    pub fn rewind_chain(&self, pool: &BufferPool, head: u64, steps: usize) -> Result<u64> {
        let mut current = head;
        for _ in 0..steps {
            if current == 0 {
                break;
            }
            current = self.read_tail_meta(pool, current, INDIRECTION_COLUMN)?;
        }
        Ok(current)
    }

    /// Reconstructs the projected columns of a record as seen from
    /// `chain_head` (a TID, or 0 for the base image).
    ///
    /// Walks newest to oldest, taking each projected column from the first
    /// tail that wrote it, and stops as soon as every projected column is
    /// resolved; whatever remains comes from the base record. Returns the
    /// projected values in ascending column order.
    pub fn reconstruct(
        &self,
        pool: &BufferPool,
        rid: Rid,
        chain_head: u64,
        projection: &[bool],
    ) -> Result<Vec<i64>> {
        debug_assert_eq!(projection.len(), self.num_columns);
        let mut values = vec![0i64; self.num_columns];
        let mut remaining: u64 = schema_mask_from_projection(projection);

        let mut current = chain_head;
        while current != 0 && remaining != 0 {
            let written = self.read_tail_meta(pool, current, SCHEMA_ENCODING_COLUMN)?;
            let mut hits = written & remaining;
            while hits != 0 {
                let column = hits.trailing_zeros() as usize;
                values[column] = self.read_tail_column(pool, current, column)?;
                hits &= hits - 1;
                remaining &= !(1 << column);
            }
            current = self.read_tail_meta(pool, current, INDIRECTION_COLUMN)?;
        }

        while remaining != 0 {
            let column = remaining.trailing_zeros() as usize;
            values[column] = self.read_base_column(pool, rid, column)?;
            remaining &= !(1 << column);
        }

        Ok(projection
            .iter()
            .enumerate()
            .filter(|(_, keep)| **keep)
            .map(|(column, _)| values[column])
            .collect())
    }
}

/// Bitmask of the columns a diff writes.
pub fn schema_mask(diff: &[Option<i64>]) -> u64 {
    diff.iter()
        .enumerate()
        .filter(|(_, v)| v.is_some())
        .fold(0u64, |mask, (column, _)| mask | (1 << column))
}

fn schema_mask_from_projection(projection: &[bool]) -> u64 {
    projection
        .iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .fold(0u64, |mask, (column, _)| mask | (1 << column))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_store::PageStore;
    use crate::rid::compose_rid;
    use tempfile::tempdir;

    fn setup(num_columns: usize) -> (tempfile::TempDir, BufferPool, PageRange) {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path());
        store.register_table(1, "t");
        let pool = BufferPool::new(store, 64);
        let range = PageRange::new(1, 0, num_columns);
        (dir, pool, range)
    }

    #[test]
    fn base_record_round_trip() {
        let (_dir, pool, range) = setup(3);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[1, 10, 20], 777).unwrap();

        assert_eq!(range.read_base_column(&pool, rid, 0).unwrap(), 1);
        assert_eq!(range.read_base_column(&pool, rid, 2).unwrap(), 20);
        assert_eq!(range.read_base_meta(&pool, rid, RID_COLUMN).unwrap(), rid);
        assert_eq!(
            range.read_base_meta(&pool, rid, INDIRECTION_COLUMN).unwrap(),
            0
        );
        assert_eq!(
            range.read_base_meta(&pool, rid, TIMESTAMP_COLUMN).unwrap(),
            777
        );
    }

    #[test]
    fn tail_chain_links_backwards() {
        let (_dir, pool, range) = setup(3);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[1, 10, 20], 0).unwrap();

        let t1 = range
            .append_tail_record(&pool, 0, &[None, Some(11), None], 0)
            .unwrap();
        let t2 = range
            .append_tail_record(&pool, t1, &[None, None, Some(22)], 0)
            .unwrap();

        assert_eq!(
            range.read_tail_meta(&pool, t2, INDIRECTION_COLUMN).unwrap(),
            t1
        );
        assert_eq!(
            range.read_tail_meta(&pool, t1, INDIRECTION_COLUMN).unwrap(),
            0
        );
        assert_eq!(
            range.read_tail_meta(&pool, t1, SCHEMA_ENCODING_COLUMN).unwrap(),
            0b010
        );
        assert_eq!(
            range.read_tail_meta(&pool, t2, SCHEMA_ENCODING_COLUMN).unwrap(),
            0b100
        );
    }

    #[test]
    fn reconstruct_merges_non_cumulative_tails() {
        let (_dir, pool, range) = setup(3);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[1, 10, 20], 0).unwrap();
        let t1 = range
            .append_tail_record(&pool, 0, &[None, Some(11), None], 0)
            .unwrap();
        let t2 = range
            .append_tail_record(&pool, t1, &[None, None, Some(22)], 0)
            .unwrap();

        let all = [true, true, true];
        assert_eq!(
            range.reconstruct(&pool, rid, t2, &all).unwrap(),
            vec![1, 11, 22]
        );
        assert_eq!(
            range.reconstruct(&pool, rid, t1, &all).unwrap(),
            vec![1, 11, 20]
        );
        assert_eq!(
            range.reconstruct(&pool, rid, 0, &all).unwrap(),
            vec![1, 10, 20]
        );
    }

    #[test]
    fn reconstruct_respects_projection() {
        let (_dir, pool, range) = setup(3);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[1, 10, 20], 0).unwrap();
        let t1 = range
            .append_tail_record(&pool, 0, &[None, Some(11), None], 0)
            .unwrap();

        assert_eq!(
            range
                .reconstruct(&pool, rid, t1, &[false, true, false])
                .unwrap(),
            vec![11]
        );
        assert_eq!(
            range
                .reconstruct(&pool, rid, t1, &[true, false, true])
                .unwrap(),
            vec![1, 20]
        );
    }

    #[test]
    fn rewind_chain_steps_back_and_saturates() {
        let (_dir, pool, range) = setup(2);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[5, 50], 0).unwrap();
        let t1 = range
            .append_tail_record(&pool, 0, &[Some(6), None], 0)
            .unwrap();
        let t2 = range
            .append_tail_record(&pool, t1, &[Some(7), None], 0)
            .unwrap();

        assert_eq!(range.rewind_chain(&pool, t2, 0).unwrap(), t2);
        assert_eq!(range.rewind_chain(&pool, t2, 1).unwrap(), t1);
        assert_eq!(range.rewind_chain(&pool, t2, 2).unwrap(), 0);
        assert_eq!(range.rewind_chain(&pool, t2, 10).unwrap(), 0);
    }

    #[test]
    fn tail_pages_grow_past_512_records() {
        let (_dir, pool, range) = setup(1);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[0], 0).unwrap();

        let mut prev = 0;
        for i in 0..(RECORDS_PER_PAGE + 3) {
            prev = range
                .append_tail_record(&pool, prev, &[Some(i as i64)], 0)
                .unwrap();
        }
        assert_eq!(range.tail_page_count(), 2);
        assert_eq!(rid::tid_page_index(prev), 1);
        assert_eq!(
            range.reconstruct(&pool, rid, prev, &[true]).unwrap(),
            vec![(RECORDS_PER_PAGE + 2) as i64]
        );
    }

    #[test]
    fn recover_restores_tail_cursor() {
        let dir = tempdir().unwrap();
        let store = PageStore::new(dir.path());
        store.register_table(1, "t");
        let pool = BufferPool::new(store, 64);

        let range = PageRange::new(1, 0, 2);
        let rid = compose_rid(0, 0, 0);
        range.write_base_record(&pool, rid, &[1, 2], 0).unwrap();
        let mut prev = 0;
        for i in 0..5 {
            prev = range
                .append_tail_record(&pool, prev, &[Some(i), None], 0)
                .unwrap();
        }
        pool.flush_all().unwrap();

        let store = PageStore::new(dir.path());
        store.register_table(1, "t");
        let pool = BufferPool::new(store, 64);
        let recovered = PageRange::recover(1, 0, 2, &pool).unwrap();
        assert_eq!(recovered.tail_page_count(), 1);

        // The next tail lands in slot 5 of page 0.
        let tid = recovered
            .append_tail_record(&pool, prev, &[None, Some(9)], 0)
            .unwrap();
        assert_eq!(rid::tid_slot(tid), 5);
        assert_eq!(
            recovered.reconstruct(&pool, rid, tid, &[true, true]).unwrap(),
            vec![4, 9]
        );
    }
}
