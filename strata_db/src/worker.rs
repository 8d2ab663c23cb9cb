//! Threaded transaction executors.
//!
//! A worker owns a queue of transactions and runs them to completion on
//! its own thread. An aborted transaction goes to the back of the queue
//! and is retried after a yield and a short random sleep; a transaction
//! that exhausts the retry limit is recorded as failed. Workers share the
//! lock manager, buffer pool, and tables through the `Arc<Table>` handles
//! inside each transaction.

use std::collections::VecDeque;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::config::EngineConfig;
use crate::transaction::Transaction;

/// Runs a batch of transactions on a dedicated thread.
pub struct TransactionWorker {
    queue: VecDeque<Transaction>,
    retry_limit: usize,
    jitter_max_ms: u64,
    stats: Vec<bool>,
    committed: usize,
    handle: Option<JoinHandle<(Vec<bool>, usize)>>,
}

impl Default for TransactionWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionWorker {
    pub fn new() -> Self {
        Self::with_config(&EngineConfig::default())
    }

    pub fn with_config(config: &EngineConfig) -> Self {
        TransactionWorker {
            queue: VecDeque::new(),
            retry_limit: config.worker_retry_limit.max(1),
            jitter_max_ms: config.retry_jitter_max_ms,
            stats: Vec::new(),
            committed: 0,
            handle: None,
        }
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.queue.push_back(transaction);
    }

    /// Spawns the worker thread over the queued transactions.
    pub fn run(&mut self) {
        let work = std::mem::take(&mut self.queue);
        let retry_limit = self.retry_limit;
        let jitter_max_ms = self.jitter_max_ms;
        self.handle = Some(thread::spawn(move || {
            execute_queue(work, retry_limit, jitter_max_ms)
        }));
    }

    /// Waits for the worker thread and collects its outcome.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let (stats, committed) = handle.join().expect("worker thread panicked");
            self.stats = stats;
            self.committed = committed;
        }
    }

    /// Commit/abort outcome per transaction, in completion order.
    pub fn stats(&self) -> &[bool] {
        &self.stats
    }

    /// Number of transactions that committed.
    pub fn committed(&self) -> usize {
        self.committed
    }
}

fn execute_queue(
    work: VecDeque<Transaction>,
    retry_limit: usize,
    jitter_max_ms: u64,
) -> (Vec<bool>, usize) {
    let mut queue: VecDeque<(Transaction, usize)> =
        work.into_iter().map(|txn| (txn, 0)).collect();
    let mut stats = Vec::new();

    while let Some((mut txn, attempts)) = queue.pop_front() {
        if txn.run() {
            stats.push(true);
            continue;
        }

        let attempts = attempts + 1;
        if attempts >= retry_limit {
            debug!(attempts, "transaction gave up");
            stats.push(false);
            continue;
        }

        // Back off briefly so the conflicting transaction can finish.
        thread::yield_now();
        if jitter_max_ms > 0 {
            let pause = rand::thread_rng().gen_range(0..=jitter_max_ms);
            thread::sleep(Duration::from_millis(pause));
        }
        queue.push_back((txn, attempts));
    }

    let committed = stats.iter().filter(|ok| **ok).count();
    (stats, committed)
}
