use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the [`CommandService`](crate::CommandService).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// How long a sync publish waits for the dispatcher's delivery report.
    pub sync_timeout_ms: u64,
    /// Number of lock stripes serializing commit + emit per entity.
    pub emit_stripes: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: 30_000,
            emit_stripes: 64,
        }
    }
}

impl CommandConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }
}
