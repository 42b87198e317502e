use thiserror::Error;

/// Errors produced when validating keys and command inputs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("missing tenant code for partition key {pk:?}")]
    MissingTenant { pk: String },

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TypeError {
    pub fn invalid_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
