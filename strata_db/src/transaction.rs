//! Strict two-phase-locking transactions.
//!
//! A transaction batches queries against one or more tables, acquires
//! record locks as it executes (shared for reads at enumeration time,
//! exclusive for writes), and holds every lock until commit or abort. Lock
//! acquisition never blocks: any conflict aborts the whole transaction,
//! which walks its rollback log in reverse and releases its locks; workers
//! re-run aborted transactions.

use std::sync::Arc;

use groundwork::lock_manager::{LockMode, TxnId};
use groundwork::Rid;
use tracing::{debug, error};

use crate::errors::DbError;
use crate::table::{DeleteUndo, Record, Table, UpdateUndo};

/// One query inside a transaction.
#[derive(Debug, Clone)]
pub enum QueryOp {
    Insert {
        values: Vec<i64>,
    },
    Update {
        key: i64,
        diff: Vec<Option<i64>>,
    },
    Delete {
        key: i64,
    },
    Select {
        key: i64,
        column: usize,
        projection: Vec<bool>,
    },
    SelectVersion {
        key: i64,
        column: usize,
        projection: Vec<bool>,
        version: i64,
    },
    Sum {
        start: i64,
        end: i64,
        column: usize,
    },
    SumVersion {
        start: i64,
        end: i64,
        column: usize,
        version: i64,
    },
    Increment {
        key: i64,
        column: usize,
    },
}

/// Result of one committed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Rows(Vec<Record>),
    Sum(i64),
    Done,
}

enum UndoEntry {
    Insert {
        table: Arc<Table>,
        rid: Rid,
        values: Vec<i64>,
    },
    Update {
        table: Arc<Table>,
        undo: UpdateUndo,
    },
    Delete {
        table: Arc<Table>,
        undo: DeleteUndo,
    },
}

/// A batch of queries committed or aborted as one unit.
pub struct Transaction {
    id: Option<TxnId>,
    ops: Vec<(Arc<Table>, QueryOp)>,
    results: Vec<QueryResult>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Transaction {
            id: None,
            ops: Vec::new(),
            results: Vec::new(),
        }
    }

    /// Appends a query. Queries execute in insertion order.
    pub fn add_query(&mut self, table: &Arc<Table>, op: QueryOp) {
        self.ops.push((table.clone(), op));
    }

    /// Read results of the last committed run, in query order. Write
    /// queries contribute [`QueryResult::Done`].
    pub fn results(&self) -> &[QueryResult] {
        &self.results
    }

    pub(crate) fn take_results(&mut self) -> Vec<QueryResult> {
        std::mem::take(&mut self.results)
    }

    /// Executes the batch once under strict 2PL. Returns true on commit.
    /// On abort every effect is rolled back and every lock released; the
    /// transaction can be re-run.
    pub fn run(&mut self) -> bool {
        let Some((first_table, _)) = self.ops.first() else {
            return true;
        };
        let txn = *self.id.get_or_insert_with(|| first_table.next_txn_id());
        // All tables of one database share a lock manager.
        let locks = first_table.locks();
        self.results.clear();

        let mut undo_log: Vec<UndoEntry> = Vec::new();
        for (table, op) in &self.ops {
            if table.is_poisoned() {
                Self::rollback(txn, &mut undo_log);
                locks.release_all(txn);
                return false;
            }
            match Self::execute(txn, table, op, &mut undo_log) {
                Ok(result) => self.results.push(result),
                Err(e) => {
                    if e.is_fatal() {
                        table.poison();
                        error!(txn, error = %e, "transaction hit fatal storage error");
                    } else {
                        debug!(txn, error = %e, "transaction aborted");
                    }
                    Self::rollback(txn, &mut undo_log);
                    locks.release_all(txn);
                    return false;
                }
            }
        }

        // Strict 2PL: locks drop only now, after every effect is in place.
        locks.release_all(txn);
        true
    }

    fn execute(
        txn: TxnId,
        table: &Arc<Table>,
        op: &QueryOp,
        undo_log: &mut Vec<UndoEntry>,
    ) -> Result<QueryResult, DbError> {
        match op {
            QueryOp::Insert { values } => {
                let rid = table.insert_row(txn, values)?;
                undo_log.push(UndoEntry::Insert {
                    table: table.clone(),
                    rid,
                    values: values.clone(),
                });
                Ok(QueryResult::Done)
            }

            QueryOp::Update { key, diff } => {
                let rid = Self::locate_one(table, *key)?;
                Self::lock(txn, table, rid, LockMode::Exclusive)?;
                let undo = table.append_update(rid, diff)?;
                undo_log.push(UndoEntry::Update {
                    table: table.clone(),
                    undo,
                });
                Ok(QueryResult::Done)
            }

            QueryOp::Delete { key } => {
                let rid = Self::locate_one(table, *key)?;
                Self::lock(txn, table, rid, LockMode::Exclusive)?;
                let undo = table.mark_deleted(rid)?;
                undo_log.push(UndoEntry::Delete {
                    table: table.clone(),
                    undo,
                });
                Ok(QueryResult::Done)
            }

            QueryOp::Select {
                key,
                column,
                projection,
            } => Self::read_matching(txn, table, *key, *column, projection, 0),

            QueryOp::SelectVersion {
                key,
                column,
                projection,
                version,
            } => Self::read_matching(txn, table, *key, *column, projection, steps_back(*version)),

            QueryOp::Sum { start, end, column } => {
                Self::aggregate(txn, table, *start, *end, *column, 0)
            }

            QueryOp::SumVersion {
                start,
                end,
                column,
                version,
            } => Self::aggregate(txn, table, *start, *end, *column, steps_back(*version)),

            QueryOp::Increment { key, column } => {
                if *column >= table.num_columns() {
                    return Err(DbError::SchemaMismatch(format!(
                        "increment column {column} out of range"
                    )));
                }
                let rid = Self::locate_one(table, *key)?;
                Self::lock(txn, table, rid, LockMode::Exclusive)?;
                let mut projection = vec![false; table.num_columns()];
                projection[*column] = true;
                let row = table.read_row(rid, &projection, 0)?.ok_or(DbError::NotFound)?;
                let mut diff = vec![None; table.num_columns()];
                diff[*column] = Some(row[0] + 1);
                let undo = table.append_update(rid, &diff)?;
                undo_log.push(UndoEntry::Update {
                    table: table.clone(),
                    undo,
                });
                Ok(QueryResult::Done)
            }
        }
    }

    fn locate_one(table: &Arc<Table>, key: i64) -> Result<Rid, DbError> {
        table
            .locate(table.key_column(), key)
            .first()
            .copied()
            .ok_or(DbError::NotFound)
    }

    fn lock(txn: TxnId, table: &Arc<Table>, rid: Rid, mode: LockMode) -> Result<(), DbError> {
        table
            .locks()
            .try_acquire(txn, table.id(), rid, mode)
            .map_err(DbError::from)
    }

    fn read_matching(
        txn: TxnId,
        table: &Arc<Table>,
        key: i64,
        column: usize,
        projection: &[bool],
        steps: usize,
    ) -> Result<QueryResult, DbError> {
        let mut records = Vec::new();
        for rid in table.locate(column, key) {
            Self::lock(txn, table, rid, LockMode::Shared)?;
            let Some(columns) = table.read_row(rid, projection, steps)? else {
                continue;
            };
            let key_value = match table.read_key(rid)? {
                Some(k) => k,
                None => continue,
            };
            records.push(Record {
                rid,
                key: key_value,
                columns,
            });
        }
        Ok(QueryResult::Rows(records))
    }

    /// Range aggregation over the primary key. Shared locks are taken on
    /// the RIDs enumerated now; rows inserted afterwards are not observed
    /// (no phantom protection).
    fn aggregate(
        txn: TxnId,
        table: &Arc<Table>,
        start: i64,
        end: i64,
        column: usize,
        steps: usize,
    ) -> Result<QueryResult, DbError> {
        if column >= table.num_columns() {
            return Err(DbError::SchemaMismatch(format!(
                "aggregate column {column} out of range"
            )));
        }
        let mut projection = vec![false; table.num_columns()];
        projection[column] = true;

        let mut total: i64 = 0;
        for rid in table.locate_key_range(start, end) {
            Self::lock(txn, table, rid, LockMode::Shared)?;
            if let Some(row) = table.read_row(rid, &projection, steps)? {
                total = total.wrapping_add(row[0]);
            }
        }
        Ok(QueryResult::Sum(total))
    }

    fn rollback(txn: TxnId, undo_log: &mut Vec<UndoEntry>) {
        for entry in undo_log.drain(..).rev() {
            let (table, outcome) = match &entry {
                UndoEntry::Insert { table, rid, values } => {
                    (table, table.retract_insert(*rid, values))
                }
                UndoEntry::Update { table, undo } => (table, table.undo_update(undo)),
                UndoEntry::Delete { table, undo } => (table, table.undo_delete(undo)),
            };
            if let Err(e) = outcome {
                table.poison();
                error!(txn, error = %e, "rollback failed; poisoning database");
            }
        }
    }
}

fn steps_back(version: i64) -> usize {
    version.min(0).unsigned_abs() as usize
}
