use serde::{Deserialize, Serialize};

/// Filter and paging for a partition listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionQuery {
    /// Only sort keys starting with this prefix.
    #[serde(default)]
    pub sk_prefix: Option<String>,
    /// Maximum number of items per page.
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Opaque cursor returned by the previous page.
    #[serde(default)]
    pub cursor: Option<String>,
    /// Include logically deleted rows.
    #[serde(default)]
    pub include_deleted: bool,
}

fn default_limit() -> usize {
    100
}

impl Default for PartitionQuery {
    fn default() -> Self {
        Self {
            sk_prefix: None,
            limit: default_limit(),
            cursor: None,
            include_deleted: false,
        }
    }
}

impl PartitionQuery {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sk_prefix = Some(prefix.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// One page of results plus the cursor for the next page, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
        }
    }

    pub fn is_last(&self) -> bool {
        self.cursor.is_none()
    }
}
