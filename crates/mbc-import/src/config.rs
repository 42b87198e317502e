use serde::{Deserialize, Serialize};

use mbc_command::Backoff;

/// Configuration for the [`ImportOrchestrator`](crate::ImportOrchestrator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Rows processed concurrently across all jobs.
    pub max_concurrency: usize,
    /// Extra compare/map/publish rounds after a version conflict.
    pub conflict_retries: u32,
    /// Extra delivery attempts for a workflow callback.
    pub callback_retries: u32,
    pub callback_backoff: Backoff,
    /// Poll interval used by [`wait_for`](crate::ImportOrchestrator::wait_for).
    pub poll_interval_ms: u64,
    /// Largest uncompressed CSV file accepted from an archive.
    pub max_entry_bytes: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 20,
            conflict_retries: 3,
            callback_retries: 3,
            callback_backoff: Backoff::new(200, 5_000),
            poll_interval_ms: 50,
            max_entry_bytes: 64 * 1024 * 1024,
        }
    }
}
