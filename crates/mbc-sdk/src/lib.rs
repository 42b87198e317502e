//! High-level SDK for the MBC CQRS core.
//!
//! [`Cqrs`] wires the command store, change feed, projector, data-sync
//! dispatcher, tenant settings cache and import orchestrator into one handle.
//! This is the main entry point for applications embedding the core.

pub mod config;
pub mod cqrs;
pub mod error;

#[cfg(test)]
mod scenarios;

pub use config::{CqrsConfig, SettingsConfig};
pub use cqrs::{Cqrs, CqrsBuilder};
pub use error::{SdkError, SdkResult};

// Re-export key types
pub use mbc_command::{CommandError, PublishMode};
pub use mbc_import::{
    CsvImportRequest, ImportJob, ImportMode, JobFailure, JobKind, JobStatus, SingleImportRequest,
    ZipImportRequest,
};
pub use mbc_store::{Page, PartitionQuery};
pub use mbc_sync::{DataSyncHandler, DeadLetter, SnapshotMirror};
pub use mbc_types::{
    Attributes, CommandInput, CommandRecord, DataRecord, HistoryRecord, InvokeContext, PartialUpdate,
};
