use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use mbc_types::{Attributes, InvokeContext};

use crate::callback::WorkflowCallback;
use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::ingest::{parse_csv, read_archive, ArchiveEntry, CsvRow};
use crate::job::{ImportJob, JobFailure, JobKind, JobStatus, ValidationFailure};
use crate::registry::ImportRegistry;
use crate::store::{JobStore, JobUpdate};
use crate::strategy::{RowOutcome, RowPipeline};

/// How a CSV job is driven.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Rows run before the call returns.
    #[default]
    Direct,
    /// The job is queued and rows run in the background.
    Orchestrated,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleImportRequest {
    pub table_name: String,
    pub tenant_code: String,
    pub attributes: Attributes,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvImportRequest {
    pub table_name: String,
    pub tenant_code: String,
    pub content: String,
    #[serde(default)]
    pub mode: ImportMode,
    #[serde(default)]
    pub task_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ZipImportRequest {
    pub tenant_code: String,
    pub archive: Vec<u8>,
    /// Table for each CSV entry, in archive order. `None` derives the table
    /// from each file's stem.
    pub tables: Option<Vec<String>>,
    pub task_token: Option<String>,
}

struct Core {
    registry: Arc<ImportRegistry>,
    jobs: Arc<dyn JobStore>,
    callback: Arc<dyn WorkflowCallback>,
    config: ImportConfig,
    permits: Arc<Semaphore>,
}

/// Drives import jobs from submission to a single terminal status.
#[derive(Clone)]
pub struct ImportOrchestrator {
    core: Arc<Core>,
}

fn require_tenant(tenant_code: &str) -> ImportResult<()> {
    if tenant_code.trim().is_empty() {
        return Err(ImportError::InvalidRequest("tenantCode is required".into()));
    }
    Ok(())
}

fn import_context(ctx: &InvokeContext, table: &str) -> InvokeContext {
    ctx.clone().with_source(format!("import:{table}"))
}

impl ImportOrchestrator {
    pub fn new(
        registry: Arc<ImportRegistry>,
        jobs: Arc<dyn JobStore>,
        callback: Arc<dyn WorkflowCallback>,
        config: ImportConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            core: Arc::new(Core {
                registry,
                jobs,
                callback,
                config,
                permits,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ImportRegistry> {
        &self.core.registry
    }

    pub fn config(&self) -> &ImportConfig {
        &self.core.config
    }

    pub fn job(&self, id: &str) -> ImportResult<Option<ImportJob>> {
        self.core.jobs.get(id)
    }

    pub fn children(&self, id: &str) -> ImportResult<Vec<ImportJob>> {
        self.core.jobs.children(id)
    }

    /// Import one record and return its finished job.
    pub async fn submit_single(
        &self,
        request: SingleImportRequest,
        ctx: &InvokeContext,
    ) -> ImportResult<ImportJob> {
        require_tenant(&request.tenant_code)?;
        let pipeline = self.core.registry.get(&request.table_name)?;

        let job = ImportJob::new(JobKind::Single, &request.table_name, &request.tenant_code)
            .with_attributes(request.attributes.clone());
        let job = self.core.jobs.insert(job)?;
        self.core
            .jobs
            .transition(&job.id, JobStatus::Processing, JobUpdate::default())?;

        let ctx = import_context(ctx, &request.table_name);
        let outcome = {
            let _permit = self
                .core
                .permits
                .acquire()
                .await
                .map_err(|e| ImportError::InvalidRequest(e.to_string()))?;
            pipeline
                .run(
                    &request.attributes,
                    &request.tenant_code,
                    &ctx,
                    self.core.config.conflict_retries,
                )
                .await
        };

        let (status, update) = leaf_outcome(&outcome);
        self.core.complete(&job.id, status, update).await
    }

    /// Import a CSV file. Direct mode returns the finished job; orchestrated
    /// mode returns the queued job immediately.
    pub async fn submit_csv(
        &self,
        request: CsvImportRequest,
        ctx: &InvokeContext,
    ) -> ImportResult<ImportJob> {
        require_tenant(&request.tenant_code)?;
        let pipeline = self.core.registry.get(&request.table_name)?;
        let rows = parse_csv(&request.content)?;

        let job = ImportJob::new(JobKind::Csv, &request.table_name, &request.tenant_code)
            .with_total(rows.len() as u64)
            .with_task_token(request.task_token.clone());
        let job = self.core.jobs.insert(job)?;
        info!(job = %job.id, table = %request.table_name, rows = rows.len(), mode = ?request.mode, "csv import submitted");

        let ctx = import_context(ctx, &request.table_name);
        match request.mode {
            ImportMode::Direct => {
                let job = self
                    .core
                    .jobs
                    .transition(&job.id, JobStatus::Processing, JobUpdate::default())?;
                self.core.run_csv(&job, pipeline, rows, &ctx).await;
                self.job(&job.id)?.ok_or(ImportError::JobNotFound(job.id))
            }
            ImportMode::Orchestrated => {
                let queued = self
                    .core
                    .jobs
                    .transition(&job.id, JobStatus::Queued, JobUpdate::default())?;
                let core = self.core.clone();
                let id = queued.id.clone();
                tokio::spawn(async move {
                    match core.jobs.transition(&id, JobStatus::Processing, JobUpdate::default()) {
                        Ok(job) => core.run_csv(&job, pipeline, rows, &ctx).await,
                        Err(e) => error!(job = %id, error = %e, "queued csv job could not start"),
                    }
                });
                Ok(queued)
            }
        }
    }

    /// Import every CSV file of an archive, one file after another, in the
    /// background. Returns the queued ZIP job.
    pub async fn submit_zip(
        &self,
        request: ZipImportRequest,
        ctx: &InvokeContext,
    ) -> ImportResult<ImportJob> {
        require_tenant(&request.tenant_code)?;
        let entries = read_archive(&request.archive, self.core.config.max_entry_bytes)?;
        if entries.is_empty() {
            return Err(ImportError::InvalidRequest("archive contains no csv files".into()));
        }

        let tables = match request.tables {
            Some(tables) if tables.len() != entries.len() => {
                return Err(ImportError::InvalidRequest(format!(
                    "{} table(s) given for {} csv file(s)",
                    tables.len(),
                    entries.len()
                )))
            }
            Some(tables) => tables,
            None => entries.iter().map(|e| e.stem.clone()).collect(),
        };

        let job = ImportJob::new(JobKind::Zip, tables.join(","), &request.tenant_code)
            .with_total(entries.len() as u64)
            .with_task_token(request.task_token);
        let job = self.core.jobs.insert(job)?;
        let queued = self
            .core
            .jobs
            .transition(&job.id, JobStatus::Queued, JobUpdate::default())?;
        info!(job = %queued.id, files = entries.len(), "zip import submitted");

        let core = self.core.clone();
        let ctx = ctx.clone();
        let tenant_code = request.tenant_code;
        let id = queued.id.clone();
        tokio::spawn(async move {
            let zip = match core.jobs.transition(&id, JobStatus::Processing, JobUpdate::default()) {
                Ok(job) => job,
                Err(e) => {
                    error!(job = %id, error = %e, "queued zip job could not start");
                    return;
                }
            };
            for (entry, table) in entries.into_iter().zip(tables) {
                core.run_archive_entry(&zip, &tenant_code, &table, &entry, &ctx)
                    .await;
            }
            core.finalize(&zip.id).await;
        });

        Ok(queued)
    }

    /// Set a job's status from outside the orchestrator. A terminal status
    /// rolls up into the parent and resolves the job's task token.
    pub async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<JobFailure>,
    ) -> ImportResult<ImportJob> {
        let update = JobUpdate {
            result: None,
            error,
        };
        self.core.complete(id, status, update).await
    }

    /// Poll until the job is terminal.
    pub async fn wait_for(&self, id: &str, timeout: Duration) -> ImportResult<ImportJob> {
        let poll = Duration::from_millis(self.core.config.poll_interval_ms.max(1));
        let wait = async {
            loop {
                match self.job(id)? {
                    Some(job) if job.status.is_terminal() => return Ok(job),
                    Some(_) => tokio::time::sleep(poll).await,
                    None => return Err(ImportError::JobNotFound(id.to_string())),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ImportError::Timeout(id.to_string()))?
    }
}

fn leaf_outcome(outcome: &RowOutcome) -> (JobStatus, JobUpdate) {
    match outcome {
        RowOutcome::Published(_) | RowOutcome::Unchanged => (
            JobStatus::Completed,
            JobUpdate {
                result: outcome.to_result(),
                error: None,
            },
        ),
        RowOutcome::Invalid(failures) => (
            JobStatus::Failed,
            JobUpdate::error(JobFailure::Validation {
                failures: failures.clone(),
            }),
        ),
        RowOutcome::Failed(message) => (
            JobStatus::Failed,
            JobUpdate::error(JobFailure::processing(message)),
        ),
    }
}

impl Core {
    /// Transition to `status`; on a terminal status roll up into the parent
    /// and resolve the task token.
    async fn complete(
        &self,
        id: &str,
        status: JobStatus,
        update: JobUpdate,
    ) -> ImportResult<ImportJob> {
        let job = self.jobs.transition(id, status, update)?;
        if status.is_terminal() {
            if let Some(parent) = &job.parent_id {
                self.child_done(parent, status == JobStatus::Completed).await;
            }
            self.resolve_token(&job).await?;
        }
        Ok(job)
    }

    async fn child_done(&self, parent_id: &str, succeeded: bool) {
        if let Err(e) = self.jobs.record_child_outcome(parent_id, succeeded) {
            error!(parent = parent_id, error = %e, "could not record child outcome");
            return;
        }
        self.finalize(parent_id).await;
    }

    /// Finalize `id` if all its children reported, then walk up the parent
    /// chain.
    async fn finalize(&self, id: &str) {
        let mut current = id.to_string();
        loop {
            let done = match self.jobs.try_finalize(&current) {
                Ok(Some(done)) => done,
                Ok(None) => return,
                Err(e) => {
                    error!(job = %current, error = %e, "could not finalize job");
                    return;
                }
            };
            info!(
                job = %done.id,
                kind = ?done.kind,
                status = %done.status,
                total = done.total_rows,
                processed = done.processed_rows,
                failed = done.failed_rows,
                "import job finished"
            );
            // Exhaustion is already logged; the job's own status stands.
            let _ = self.resolve_token(&done).await;

            let Some(parent) = done.parent_id.clone() else {
                return;
            };
            if let Err(e) = self
                .jobs
                .record_child_outcome(&parent, done.status == JobStatus::Completed)
            {
                error!(parent = %parent, error = %e, "could not record child outcome");
                return;
            }
            current = parent;
        }
    }

    /// Resolve the job's task token exactly once, retrying delivery.
    async fn resolve_token(&self, job: &ImportJob) -> ImportResult<()> {
        let Some(token) = self.jobs.claim_token(&job.id)? else {
            return Ok(());
        };

        let allowed = self.config.callback_retries + 1;
        let mut attempt = 1;
        loop {
            let sent = if job.status == JobStatus::Completed {
                self.callback.send_success(&token, &job.summary()).await
            } else {
                let cause = match &job.error {
                    Some(e) => format!("{e} {}", job.summary()),
                    None => job.summary().to_string(),
                };
                self.callback.send_failure(&token, "ImportFailed", &cause).await
            };

            match sent {
                Ok(()) => {
                    debug!(job = %job.id, status = %job.status, "workflow token resolved");
                    return Ok(());
                }
                Err(e) if attempt < allowed => {
                    let delay = self.config.callback_backoff.delay(attempt);
                    warn!(job = %job.id, attempt, ?delay, error = %e, "workflow callback failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(job = %job.id, attempts = attempt, error = %e, "workflow callback exhausted");
                    return Err(ImportError::WorkflowCallback {
                        job_id: job.id.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// Run every row of a `PROCESSING` CSV job and finalize it.
    async fn run_csv(
        self: &Arc<Self>,
        job: &ImportJob,
        pipeline: Arc<dyn RowPipeline>,
        rows: Vec<CsvRow>,
        ctx: &InvokeContext,
    ) {
        let mut tasks = Vec::with_capacity(rows.len());
        for (index, raw) in rows.into_iter().enumerate() {
            let line = index as u64 + 1;
            let mut row = ImportJob::new(JobKind::Row, &job.table_name, &job.tenant_code)
                .with_parent(&job.id)
                .with_row(line);
            if let Ok(attributes) = &raw {
                row = row.with_attributes(attributes.clone());
            }
            let row = match self.jobs.insert(row) {
                Ok(row) => row,
                Err(e) => {
                    error!(job = %job.id, row = line, error = %e, "could not create row job");
                    self.child_done(&job.id, false).await;
                    continue;
                }
            };

            let attributes = match raw {
                Ok(attributes) => attributes,
                Err(reason) => {
                    debug!(row = %row.id, line, %reason, "malformed csv record");
                    let update = JobUpdate::error(JobFailure::Validation {
                        failures: vec![ValidationFailure::new("record", reason)],
                    });
                    self.finish_row(&row, JobStatus::Failed, update).await;
                    continue;
                }
            };

            let core = self.clone();
            let pipeline = pipeline.clone();
            let ctx = ctx.clone();
            let spawned = row.clone();
            tasks.push((
                row,
                tokio::spawn(async move { core.run_row(spawned, attributes, pipeline, ctx).await }),
            ));
        }

        for (row, task) in tasks {
            if let Err(e) = task.await {
                error!(row = %row.id, error = %e, "row task aborted");
                let update = JobUpdate::error(JobFailure::processing(format!("row task aborted: {e}")));
                self.finish_row(&row, JobStatus::Failed, update).await;
            }
        }

        // Covers files with no rows.
        self.finalize(&job.id).await;
    }

    async fn run_row(
        self: Arc<Self>,
        row: ImportJob,
        raw: Attributes,
        pipeline: Arc<dyn RowPipeline>,
        ctx: InvokeContext,
    ) {
        let outcome = match self.permits.clone().acquire_owned().await {
            Ok(_permit) => match self
                .jobs
                .transition(&row.id, JobStatus::Processing, JobUpdate::default())
            {
                Ok(_) => {
                    pipeline
                        .run(&raw, &row.tenant_code, &ctx, self.config.conflict_retries)
                        .await
                }
                Err(e) => {
                    warn!(row = %row.id, error = %e, "row job could not start");
                    RowOutcome::Failed(format!("row job could not start: {e}"))
                }
            },
            Err(e) => RowOutcome::Failed(e.to_string()),
        };

        if !outcome.is_success() {
            debug!(row = %row.id, line = ?row.row, outcome = ?outcome, "row failed");
        }
        let (status, update) = leaf_outcome(&outcome);
        self.finish_row(&row, status, update).await;
    }

    /// Store a row's terminal status and count it in its parent.
    ///
    /// The parent is counted even when the row's own status cannot be
    /// stored, so it always finalizes. A row that another caller already
    /// finished was counted by that caller.
    async fn finish_row(&self, row: &ImportJob, status: JobStatus, update: JobUpdate) {
        let succeeded = match self.jobs.transition(&row.id, status, update) {
            Ok(done) => {
                // Exhaustion is already logged; the row's own status stands.
                let _ = self.resolve_token(&done).await;
                status == JobStatus::Completed
            }
            Err(e) => {
                if matches!(self.jobs.get(&row.id), Ok(Some(stored)) if stored.status.is_terminal()) {
                    warn!(row = %row.id, error = %e, "row already finished");
                    return;
                }
                error!(row = %row.id, error = %e, "could not store row outcome; counting it as failed");
                false
            }
        };
        if let Some(parent) = &row.parent_id {
            self.child_done(parent, succeeded).await;
        }
    }

    /// Import one CSV file of a ZIP job as a child CSV job.
    async fn run_archive_entry(
        self: &Arc<Self>,
        zip: &ImportJob,
        tenant_code: &str,
        table: &str,
        entry: &ArchiveEntry,
        ctx: &InvokeContext,
    ) {
        let source = entry.name.as_str();
        let prepared = self.registry.get(table).and_then(|pipeline| {
            let content = entry
                .content
                .as_ref()
                .map_err(|e| ImportError::InvalidRequest(format!("{source}: {e}")))?;
            Ok((pipeline, parse_csv(content)?))
        });

        let child = ImportJob::new(JobKind::Csv, table, tenant_code)
            .with_parent(&zip.id)
            .with_source(source);

        match prepared {
            Ok((pipeline, rows)) => {
                let child = child.with_total(rows.len() as u64);
                let started = self.jobs.insert(child).and_then(|c| {
                    self.jobs
                        .transition(&c.id, JobStatus::Processing, JobUpdate::default())
                });
                match started {
                    Ok(child) => {
                        let ctx = import_context(ctx, table);
                        self.run_csv(&child, pipeline, rows, &ctx).await;
                    }
                    Err(e) => {
                        error!(job = %zip.id, file = source, error = %e, "could not start csv child");
                        self.child_done(&zip.id, false).await;
                    }
                }
            }
            Err(e) => {
                warn!(job = %zip.id, file = source, table, error = %e, "archive entry rejected");
                let failed = self.jobs.insert(child).and_then(|c| {
                    self.jobs.transition(
                        &c.id,
                        JobStatus::Failed,
                        JobUpdate::error(JobFailure::processing(&e)),
                    )
                });
                if let Err(store_err) = failed {
                    error!(job = %zip.id, error = %store_err, "could not record rejected entry");
                }
                self.child_done(&zip.id, false).await;
            }
        }
    }
}
