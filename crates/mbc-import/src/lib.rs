//! Bulk import and export for the MBC CQRS core.
//!
//! Imports are tracked as a tree of [`ImportJob`]s: a ZIP job owns one CSV
//! job per file and a CSV job owns one ROW job per line. Each row runs
//! through the table's [`RowPipeline`] (transform, validate, compare, map)
//! and lands in the command service as an ordinary publish. Every terminal
//! child bumps its parent's counters; the last one to report finalizes the
//! parent exactly once and resolves its workflow task token.

pub mod callback;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod job;
pub mod orchestrator;
pub mod registry;
pub mod store;
pub mod strategy;

pub use callback::{CallbackDelivery, InMemoryCallback, LoggingCallback, WorkflowCallback};
pub use config::ImportConfig;
pub use error::{ImportError, ImportResult};
pub use export::export_csv;
pub use ingest::{parse_csv, read_archive, ArchiveEntry, CsvRow, EntryError};
pub use job::{ImportJob, JobFailure, JobKind, JobStatus, ValidationFailure};
pub use orchestrator::{
    CsvImportRequest, ImportMode, ImportOrchestrator, SingleImportRequest, ZipImportRequest,
};
pub use registry::ImportRegistry;
pub use store::{InMemoryJobStore, JobStore, JobUpdate};
pub use strategy::{
    AttributeRow, AttributeTableStrategy, Comparison, ComparisonStatus, ImportStrategy,
    ProcessStrategy, RowOutcome, RowPipeline, TablePipeline,
};
