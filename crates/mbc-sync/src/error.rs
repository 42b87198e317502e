use mbc_command::CommandError;
use mbc_store::StoreError;
use mbc_stream::FeedError;

/// Errors produced by the sync pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A data-sync handler failed to apply a record.
    #[error("handler {handler} failed: {message}")]
    Handler { handler: String, message: String },

    #[error("handler already registered: {0}")]
    DuplicateHandler(String),

    #[error("dispatcher is not running")]
    NotRunning,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Reconciling recovered events with the command log failed.
    #[error("command log error: {0}")]
    Command(#[from] CommandError),

    #[error("feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl SyncError {
    pub fn handler(handler: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Handler {
            handler: handler.into(),
            message: message.to_string(),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
