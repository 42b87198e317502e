use mbc_command::CommandError;

use crate::job::JobStatus;

/// Errors from the import/export orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("no import pipeline registered for table {0}")]
    UnknownTable(String),

    #[error("import pipeline already registered for table {0}")]
    DuplicateTable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("zip error: {0}")]
    Zip(String),

    /// The workflow engine could not be told about a finished job.
    #[error("workflow callback for job {job_id} failed after {attempts} attempt(s): {message}")]
    WorkflowCallback {
        job_id: String,
        attempts: u32,
        message: String,
    },

    #[error("command error: {0}")]
    Command(#[from] CommandError),

    #[error("timed out waiting for job {0}")]
    Timeout(String),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl From<csv::Error> for ImportError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e.to_string())
    }
}

impl From<zip::result::ZipError> for ImportError {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Zip(e.to_string())
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
