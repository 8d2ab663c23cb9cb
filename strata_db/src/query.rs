//! The public query surface.
//!
//! Each call runs as a single-query strict-2PL transaction and is given
//! exactly one attempt: a lock conflict inside the call's scope surfaces as
//! `false` (writes) or `None` (reads), never as an error. Batched retrying
//! execution lives in [`Transaction`] and [`TransactionWorker`].
//!
//! [`TransactionWorker`]: crate::TransactionWorker

use std::sync::Arc;

use crate::table::{Record, Table};
use crate::transaction::{QueryOp, QueryResult, Transaction};

/// Query handle over one table.
pub struct Query {
    table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Query { table }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn run_single(&self, op: QueryOp) -> Option<QueryResult> {
        if self.table.is_poisoned() {
            return None;
        }
        let mut txn = Transaction::new();
        txn.add_query(&self.table, op);
        if txn.run() {
            txn.take_results().pop()
        } else {
            None
        }
    }

    /// Inserts a row. False on wrong arity, duplicate key, or conflict.
    pub fn insert(&self, values: &[i64]) -> bool {
        self.run_single(QueryOp::Insert {
            values: values.to_vec(),
        })
        .is_some()
    }

    /// Latest version of every record matching `key` in `column`.
    /// `Some(vec![])` when nothing matches; `None` on conflict.
    pub fn select(&self, key: i64, column: usize, projection: &[bool]) -> Option<Vec<Record>> {
        match self.run_single(QueryOp::Select {
            key,
            column,
            projection: projection.to_vec(),
        })? {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Like [`select`](Self::select), `version` steps behind the latest
    /// (0 = latest, -1 = one before, ...).
    pub fn select_version(
        &self,
        key: i64,
        column: usize,
        projection: &[bool],
        version: i64,
    ) -> Option<Vec<Record>> {
        match self.run_single(QueryOp::SelectVersion {
            key,
            column,
            projection: projection.to_vec(),
            version,
        })? {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Applies a non-cumulative update; `None` entries leave the column
    /// unchanged. False when the key is absent, the new key collides, or
    /// the record is locked.
    pub fn update(&self, key: i64, diff: &[Option<i64>]) -> bool {
        self.run_single(QueryOp::Update {
            key,
            diff: diff.to_vec(),
        })
        .is_some()
    }

    /// Logically deletes the row. False when absent or locked.
    pub fn delete(&self, key: i64) -> bool {
        self.run_single(QueryOp::Delete { key }).is_some()
    }

    /// Sums `column` over primary keys in `[start, end]`. An empty or
    /// inverted range sums to 0; `None` on conflict.
    pub fn sum(&self, start: i64, end: i64, column: usize) -> Option<i64> {
        match self.run_single(QueryOp::Sum { start, end, column })? {
            QueryResult::Sum(total) => Some(total),
            _ => None,
        }
    }

    /// Like [`sum`](Self::sum) at a relative version.
    pub fn sum_version(&self, start: i64, end: i64, column: usize, version: i64) -> Option<i64> {
        match self.run_single(QueryOp::SumVersion {
            start,
            end,
            column,
            version,
        })? {
            QueryResult::Sum(total) => Some(total),
            _ => None,
        }
    }

    /// Adds one to `column` of the row with primary key `key`.
    pub fn increment(&self, key: i64, column: usize) -> bool {
        self.run_single(QueryOp::Increment { key, column }).is_some()
    }
}
