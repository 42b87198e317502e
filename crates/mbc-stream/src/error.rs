use std::io;

/// Errors produced by the change feed.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// I/O error during WAL or file operations.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The delivery report channel closed before the awaited report arrived.
    #[error("delivery report channel closed")]
    ReportsClosed,

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

/// Convenience alias used throughout the feed crate.
pub type Result<T> = std::result::Result<T, FeedError>;
