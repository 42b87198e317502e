use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller attribution recorded on every committed version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvokeContext {
    /// User (or service principal) that issued the command.
    pub user_id: String,
    /// Source IP address of the request, if known.
    pub ip: String,
    /// Free-form source tag, e.g. `"api"` or `"import:product"`.
    pub source: String,
    /// Correlation id of the originating request.
    pub request_id: String,
}

impl InvokeContext {
    pub fn new(user_id: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ip: ip.into(),
            source: "api".into(),
            request_id: Uuid::now_v7().to_string(),
        }
    }

    /// Context for writes issued by the framework itself (imports, tasks).
    pub fn system(source: impl Into<String>) -> Self {
        Self {
            user_id: "system".into(),
            ip: "127.0.0.1".into(),
            source: source.into(),
            request_id: Uuid::now_v7().to_string(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }
}

impl Default for InvokeContext {
    fn default() -> Self {
        Self::system("system")
    }
}
