//! Command commit path for the MBC CQRS core.
//!
//! [`CommandService`] is the single writer of the command log. A publish
//! validates the input, appends the next version through the store's
//! conditional write and emits the change event onto the feed. Sync
//! publishes additionally project the Data and History rows inline and wait
//! for the dispatcher's delivery report when one is attached.
//!
//! Conflicts are reported as [`CommandError::VersionConflict`] and are never
//! retried here; callers that want retries use [`retry_on_conflict`], which
//! re-runs their whole read-modify-write closure.

pub mod config;
pub mod error;
pub mod projector;
pub mod retry;
pub mod service;
pub mod settings;

pub use config::CommandConfig;
pub use error::{CommandError, CommandResult};
pub use projector::{CommitListener, Projection, Projector};
pub use retry::{retry_on_conflict, Backoff, RetryPolicy};
pub use service::{CommandService, PublishMode};
pub use settings::{TenantSettingsCache, SETTING_PREFIX};
