//! Record-level locks for two-phase locking.
//!
//! Locks are keyed by `(table, rid)` and come in shared and exclusive
//! modes. Acquisition is non-blocking: a conflict is returned to the caller
//! immediately and the owning transaction aborts and retries. The lock
//! table is split into hash shards, each behind its own mutex.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::trace;

use crate::TableId;

/// Identifier of a transaction, unique within one database.
pub type TxnId = u64;

/// Lock compatibility: shared/shared is the only compatible pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LockError {
    /// The lock is held in an incompatible mode by another transaction.
    #[error("lock conflict")]
    Conflict,
}

struct LockState {
    mode: LockMode,
    holders: HashSet<TxnId>,
}

const LOCK_SHARDS: usize = 16;

/// The record lock table.
pub struct LockManager {
    shards: Vec<Mutex<HashMap<(TableId, u64), LockState>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager {
            shards: (0..LOCK_SHARDS)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, rid: u64) -> &Mutex<HashMap<(TableId, u64), LockState>> {
        &self.shards[rid as usize % LOCK_SHARDS]
    }

    /// Attempts to take the lock without blocking.
    ///
    /// Re-acquiring a mode the transaction already covers succeeds; a
    /// shared-to-exclusive upgrade succeeds only when the transaction is
    /// the sole shared holder.
    pub fn try_acquire(
        &self,
        txn: TxnId,
        table: TableId,
        rid: u64,
        mode: LockMode,
    ) -> Result<(), LockError> {
        let mut shard = self.shard(rid).lock();
        match shard.entry((table, rid)) {
            Entry::Vacant(entry) => {
                let mut holders = HashSet::new();
                holders.insert(txn);
                entry.insert(LockState { mode, holders });
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                if state.holders.contains(&txn) {
                    if state.mode == LockMode::Exclusive || mode == LockMode::Shared {
                        return Ok(());
                    }
                    // Upgrade: only permitted for the sole shared holder.
                    if state.holders.len() == 1 {
                        state.mode = LockMode::Exclusive;
                        return Ok(());
                    }
                    trace!(txn, table, rid, "upgrade conflict");
                    return Err(LockError::Conflict);
                }
                if state.mode == LockMode::Shared && mode == LockMode::Shared {
                    state.holders.insert(txn);
                    return Ok(());
                }
                trace!(txn, table, rid, ?mode, "lock conflict");
                Err(LockError::Conflict)
            }
        }
    }

    /// Releases every lock the transaction holds.
    pub fn release_all(&self, txn: TxnId) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.retain(|_, state| {
                state.holders.remove(&txn);
                !state.holders.is_empty()
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        assert!(lm.try_acquire(1, 0, 5, LockMode::Shared).is_ok());
        assert!(lm.try_acquire(2, 0, 5, LockMode::Shared).is_ok());
        assert!(lm.try_acquire(3, 0, 5, LockMode::Shared).is_ok());
    }

    #[test]
    fn exclusive_conflicts_with_everything() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Exclusive).unwrap();
        assert_eq!(
            lm.try_acquire(2, 0, 5, LockMode::Shared),
            Err(LockError::Conflict)
        );
        assert_eq!(
            lm.try_acquire(2, 0, 5, LockMode::Exclusive),
            Err(LockError::Conflict)
        );
    }

    #[test]
    fn shared_blocks_foreign_exclusive() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Shared).unwrap();
        assert_eq!(
            lm.try_acquire(2, 0, 5, LockMode::Exclusive),
            Err(LockError::Conflict)
        );
    }

    #[test]
    fn reacquire_is_idempotent() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Exclusive).unwrap();
        assert!(lm.try_acquire(1, 0, 5, LockMode::Exclusive).is_ok());
        assert!(lm.try_acquire(1, 0, 5, LockMode::Shared).is_ok());
    }

    #[test]
    fn sole_holder_may_upgrade() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Shared).unwrap();
        assert!(lm.try_acquire(1, 0, 5, LockMode::Exclusive).is_ok());
        // Now exclusive: other transactions are shut out.
        assert_eq!(
            lm.try_acquire(2, 0, 5, LockMode::Shared),
            Err(LockError::Conflict)
        );
    }

    #[test]
    fn upgrade_conflicts_with_other_sharers() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Shared).unwrap();
        lm.try_acquire(2, 0, 5, LockMode::Shared).unwrap();
        assert_eq!(
            lm.try_acquire(1, 0, 5, LockMode::Exclusive),
            Err(LockError::Conflict)
        );

        lm.release_all(2);
        assert!(lm.try_acquire(1, 0, 5, LockMode::Exclusive).is_ok());
    }

    #[test]
    fn release_all_frees_every_record() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Exclusive).unwrap();
        lm.try_acquire(1, 0, 900, LockMode::Exclusive).unwrap();

        lm.release_all(1);
        assert!(lm.try_acquire(2, 0, 5, LockMode::Exclusive).is_ok());
        assert!(lm.try_acquire(2, 0, 900, LockMode::Exclusive).is_ok());
    }

    #[test]
    fn release_preserves_remaining_sharers() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Shared).unwrap();
        lm.try_acquire(2, 0, 5, LockMode::Shared).unwrap();

        lm.release_all(1);
        // Transaction 2 still holds its shared lock.
        assert_eq!(
            lm.try_acquire(3, 0, 5, LockMode::Exclusive),
            Err(LockError::Conflict)
        );
        assert!(lm.try_acquire(2, 0, 5, LockMode::Exclusive).is_ok());
    }

    #[test]
    fn records_and_tables_are_independent() {
        let lm = LockManager::new();
        lm.try_acquire(1, 0, 5, LockMode::Exclusive).unwrap();
        assert!(lm.try_acquire(2, 0, 6, LockMode::Exclusive).is_ok());
        assert!(lm.try_acquire(3, 1, 5, LockMode::Exclusive).is_ok());
    }
}
