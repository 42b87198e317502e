use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mbc_stream::{ChangeEvent, ChangeKind};
use mbc_types::CommandRecord;

use crate::error::SyncResult;

/// Downstream consumer of committed versions, e.g. a relational mirror or a
/// search index.
///
/// Delivery is at-least-once and a handler may see the same version more
/// than once, so `up` and `down` must be idempotent. Errors must be
/// returned, not swallowed: they drive retries and dead-lettering.
#[async_trait]
pub trait DataSyncHandler: Send + Sync {
    /// Unique name within a registry.
    fn name(&self) -> &str;

    /// Apply an inserted or modified version.
    async fn up(&self, record: &CommandRecord) -> SyncResult<()>;

    /// Undo or remove an entity.
    async fn down(&self, record: &CommandRecord) -> SyncResult<()>;
}

/// Which side of a handler an event is delivered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn of(event: &ChangeEvent) -> Self {
        match event.kind {
            ChangeKind::Remove => Self::Down,
            ChangeKind::Insert | ChangeKind::Modify => Self::Up,
        }
    }

    pub async fn invoke(self, handler: &dyn DataSyncHandler, record: &CommandRecord) -> SyncResult<()> {
        match self {
            Self::Up => handler.up(record).await,
            Self::Down => handler.down(record).await,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}
