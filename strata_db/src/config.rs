//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables consumed by [`Database::open_with_config`] and the transaction
/// workers.
///
/// [`Database::open_with_config`]: crate::Database::open_with_config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of frames in the buffer pool.
    pub buffer_pool_frames: usize,
    /// Attempts a worker gives one transaction before recording it failed.
    pub worker_retry_limit: usize,
    /// Upper bound of the random sleep between retry attempts.
    pub retry_jitter_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_frames: 1024,
            worker_retry_limit: 64,
            retry_jitter_max_ms: 8,
        }
    }
}
