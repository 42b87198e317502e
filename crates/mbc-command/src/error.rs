use mbc_store::StoreError;
use mbc_stream::{FeedError, HandlerFailure};
use mbc_types::{CommandRecord, TypeError};

/// Errors from the command commit path.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid input: {0}")]
    InvalidInput(#[from] TypeError),

    /// The expected version is no longer the latest.
    #[error("version conflict on {id}: expected v{expected}, current v{current}")]
    VersionConflict {
        id: String,
        expected: u64,
        current: u64,
    },

    #[error("entity not found: {0}")]
    NotFound(String),

    /// Committed, but at least one data-sync handler failed the event.
    #[error("v{} of {} committed but {} sync handler(s) failed", .record.version, .record.id, .failures.len())]
    SyncHandler {
        record: Box<CommandRecord>,
        failures: Vec<HandlerFailure>,
    },

    /// Committed, but no delivery report arrived in time. Downstream outcome
    /// is unknown.
    #[error("v{} of {} committed but sync handlers did not report within {waited_ms}ms", .record.version, .record.id)]
    SyncTimeout {
        record: Box<CommandRecord>,
        waited_ms: u64,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl CommandError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }

    /// The record that was committed despite the error, if any.
    pub fn committed_record(&self) -> Option<&CommandRecord> {
        match self {
            Self::SyncHandler { record, .. } | Self::SyncTimeout { record, .. } => Some(record),
            _ => None,
        }
    }
}

pub type CommandResult<T> = Result<T, CommandError>;
