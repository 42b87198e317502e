use std::time::Duration;

use serde::{Deserialize, Serialize};

use mbc_command::CommandConfig;
use mbc_import::ImportConfig;
use mbc_stream::FeedConfig;
use mbc_sync::DispatcherConfig;

/// Settings for every component behind a [`Cqrs`](crate::Cqrs) handle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CqrsConfig {
    pub command: CommandConfig,
    pub feed: FeedConfig,
    pub dispatcher: DispatcherConfig,
    pub import: ImportConfig,
    pub settings: SettingsConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Lifetime of a cached tenant setting.
    pub ttl_ms: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self { ttl_ms: 60_000 }
    }
}

impl SettingsConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}
