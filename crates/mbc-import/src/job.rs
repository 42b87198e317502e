use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use mbc_types::Attributes;

/// What a job imports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobKind {
    /// One record submitted directly.
    Single,
    /// One CSV file; children are `Row` jobs.
    Csv,
    /// An archive of CSV files; children are `Csv` jobs.
    Zip,
    /// One CSV row.
    Row,
}

/// Lifecycle of a job.
///
/// ```text
/// CREATED ──► QUEUED ──► PROCESSING ──► COMPLETED
///    │           │            │
///    └───────────┴────────────┴───────► FAILED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Processing)
                | (Queued, Processing)
                | (Processing, Completed)
                | (Created | Queued | Processing, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A structured validation problem in one input row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Field path, e.g. `"price"` or `"attributes.size"`.
    pub path: String,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Why a job failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobFailure {
    /// The row never reached the command service.
    Validation { failures: Vec<ValidationFailure> },
    /// Anything after validation: conflicts, store errors, child failures.
    Processing { message: String },
}

impl JobFailure {
    pub fn processing(message: impl std::fmt::Display) -> Self {
        Self::Processing {
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation { failures } => {
                let parts: Vec<String> = failures.iter().map(ToString::to_string).collect();
                write!(f, "validation failed: {}", parts.join("; "))
            }
            Self::Processing { message } => write!(f, "{message}"),
        }
    }
}

/// One unit of import work and its roll-up counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: String,
    pub kind: JobKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: JobStatus,
    pub table_name: String,
    pub tenant_code: String,
    /// Number of children (rows or files).
    pub total_rows: u64,
    /// Children that reached a terminal status.
    pub processed_rows: u64,
    /// Children that ended `FAILED`.
    pub failed_rows: u64,
    /// 1-based row number within the parent CSV.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<u64>,
    /// Archive entry the job was read from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Attributes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImportJob {
    pub fn new(kind: JobKind, table_name: impl Into<String>, tenant_code: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            parent_id: None,
            status: JobStatus::Created,
            table_name: table_name.into(),
            tenant_code: tenant_code.into(),
            total_rows: 0,
            processed_rows: 0,
            failed_rows: 0,
            row: None,
            source: None,
            task_token: None,
            attributes: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_total(mut self, total_rows: u64) -> Self {
        self.total_rows = total_rows;
        self
    }

    pub fn with_row(mut self, row: u64) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_task_token(mut self, token: Option<String>) -> Self {
        self.task_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    /// `true` once every child has reported.
    pub fn all_children_reported(&self) -> bool {
        self.processed_rows >= self.total_rows
    }

    /// Terminal status implied by the counters.
    pub fn rolled_up_status(&self) -> JobStatus {
        if self.failed_rows > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        }
    }

    /// `{total, processed, failed}` summary reported to workflows.
    pub fn summary(&self) -> Value {
        serde_json::json!({
            "total": self.total_rows,
            "processed": self.processed_rows,
            "failed": self.failed_rows,
        })
    }
}
