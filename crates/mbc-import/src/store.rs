use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::error::{ImportError, ImportResult};
use crate::job::{ImportJob, JobFailure, JobStatus};

/// Optional payload applied together with a status change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobUpdate {
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
}

impl JobUpdate {
    pub fn result(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn error(error: JobFailure) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }
}

/// Persistence for import jobs.
///
/// Every method is atomic with respect to the job(s) it touches; the
/// orchestrator relies on that for exactly-once finalization and token
/// resolution.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: ImportJob) -> ImportResult<ImportJob>;

    fn get(&self, id: &str) -> ImportResult<Option<ImportJob>>;

    /// Children of `parent_id` in creation order.
    fn children(&self, parent_id: &str) -> ImportResult<Vec<ImportJob>>;

    /// Move a job to `to`, rejecting illegal transitions.
    fn transition(&self, id: &str, to: JobStatus, update: JobUpdate) -> ImportResult<ImportJob>;

    /// Count one child as processed (and failed, unless `succeeded`).
    fn record_child_outcome(&self, parent_id: &str, succeeded: bool) -> ImportResult<ImportJob>;

    /// If the job is `PROCESSING` and every child has reported, move it to
    /// its rolled-up terminal status and return it. Returns `None` when the
    /// job is not ready or was already finalized.
    fn try_finalize(&self, id: &str) -> ImportResult<Option<ImportJob>>;

    /// Take the job's task token. Only the first caller receives it.
    fn claim_token(&self, id: &str) -> ImportResult<Option<String>>;
}

#[derive(Default)]
struct Jobs {
    by_id: HashMap<String, ImportJob>,
    order: Vec<String>,
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<Jobs>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map(|j| j.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> ImportResult<RwLockReadGuard<'_, Jobs>> {
        self.jobs.read().map_err(|_| ImportError::LockPoisoned("job store"))
    }

    fn write(&self) -> ImportResult<RwLockWriteGuard<'_, Jobs>> {
        self.jobs.write().map_err(|_| ImportError::LockPoisoned("job store"))
    }
}

fn job_mut<'a>(jobs: &'a mut Jobs, id: &str) -> ImportResult<&'a mut ImportJob> {
    jobs.by_id
        .get_mut(id)
        .ok_or_else(|| ImportError::JobNotFound(id.to_string()))
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: ImportJob) -> ImportResult<ImportJob> {
        let mut jobs = self.write()?;
        if jobs.by_id.contains_key(&job.id) {
            return Err(ImportError::InvalidRequest(format!("job {} already exists", job.id)));
        }
        jobs.order.push(job.id.clone());
        jobs.by_id.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn get(&self, id: &str) -> ImportResult<Option<ImportJob>> {
        Ok(self.read()?.by_id.get(id).cloned())
    }

    fn children(&self, parent_id: &str) -> ImportResult<Vec<ImportJob>> {
        let jobs = self.read()?;
        Ok(jobs
            .order
            .iter()
            .filter_map(|id| jobs.by_id.get(id))
            .filter(|j| j.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect())
    }

    fn transition(&self, id: &str, to: JobStatus, update: JobUpdate) -> ImportResult<ImportJob> {
        let mut jobs = self.write()?;
        let job = job_mut(&mut jobs, id)?;
        if !job.status.can_transition_to(to) {
            return Err(ImportError::InvalidTransition {
                id: id.to_string(),
                from: job.status,
                to,
            });
        }
        debug!(job = id, from = %job.status, to = %to, "job transition");
        job.status = to;
        if update.result.is_some() {
            job.result = update.result;
        }
        if update.error.is_some() {
            job.error = update.error;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn record_child_outcome(&self, parent_id: &str, succeeded: bool) -> ImportResult<ImportJob> {
        let mut jobs = self.write()?;
        let job = job_mut(&mut jobs, parent_id)?;
        job.processed_rows += 1;
        if !succeeded {
            job.failed_rows += 1;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn try_finalize(&self, id: &str) -> ImportResult<Option<ImportJob>> {
        let mut jobs = self.write()?;
        let job = job_mut(&mut jobs, id)?;
        if job.status != JobStatus::Processing || !job.all_children_reported() {
            return Ok(None);
        }
        job.status = job.rolled_up_status();
        if job.status == JobStatus::Failed && job.error.is_none() {
            job.error = Some(JobFailure::processing(format!(
                "{} of {} children failed",
                job.failed_rows, job.total_rows
            )));
        }
        job.result = Some(job.summary());
        job.updated_at = Utc::now();
        debug!(job = id, status = %job.status, "job finalized");
        Ok(Some(job.clone()))
    }

    fn claim_token(&self, id: &str) -> ImportResult<Option<String>> {
        let mut jobs = self.write()?;
        Ok(job_mut(&mut jobs, id)?.task_token.take())
    }
}
