/// Errors from table operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The conditional write lost: a record already exists at the attempted
    /// version, or the attempted version is not `current + 1`.
    #[error("conditional write failed for {id}: attempted v{attempted}, current v{current}")]
    ConditionFailed {
        id: String,
        attempted: u64,
        current: u64,
    },

    /// A history row already exists with different content.
    #[error("history record {id}@{version} is immutable")]
    Immutable { id: String, version: u64 },

    /// A pagination cursor could not be interpreted.
    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
