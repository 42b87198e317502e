use std::time::Duration;

use serde::{Deserialize, Serialize};

use mbc_command::Backoff;

/// Configuration for the [`EventDispatcher`](crate::EventDispatcher).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of sequential lanes. Each entity always maps to the same lane.
    pub workers: usize,
    /// Attempts per handler per event before dead-lettering.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// How often to compact a durable feed's WAL while idle. `0` compacts
    /// only at shutdown.
    pub checkpoint_interval_ms: u64,
}

impl DispatcherConfig {
    pub fn checkpoint_interval(&self) -> Option<Duration> {
        (self.checkpoint_interval_ms > 0).then(|| Duration::from_millis(self.checkpoint_interval_ms))
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            backoff: Backoff::new(100, 5_000),
            checkpoint_interval_ms: 30_000,
        }
    }
}
