use thiserror::Error;

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("command error: {0}")]
    Command(#[from] mbc_command::CommandError),

    #[error("sync error: {0}")]
    Sync(#[from] mbc_sync::SyncError),

    #[error("import error: {0}")]
    Import(#[from] mbc_import::ImportError),

    #[error("feed error: {0}")]
    Feed(#[from] mbc_stream::FeedError),

    #[error("store error: {0}")]
    Store(#[from] mbc_store::StoreError),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl SdkError {
    /// Current version carried by a version conflict, if this is one.
    pub fn conflict_version(&self) -> Option<u64> {
        match self {
            Self::Command(mbc_command::CommandError::VersionConflict { current, .. }) => Some(*current),
            _ => None,
        }
    }
}

pub type SdkResult<T> = Result<T, SdkError>;
