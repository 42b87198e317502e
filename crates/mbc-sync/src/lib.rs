//! Downstream data synchronization for the MBC CQRS core.
//!
//! The [`EventDispatcher`] consumes the change feed, projects every committed
//! version into the Data and History tables, then fans the record out to each
//! registered [`DataSyncHandler`]. Handlers are isolated from one another: a
//! failing handler is retried on its own and, once its attempts are spent,
//! the event is parked in the [`DeadLetterQueue`] for that handler only.
//!
//! Events of one entity are processed strictly in version order; different
//! entities proceed in parallel across worker lanes.

pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod mirror;
pub mod registry;

pub use config::DispatcherConfig;
pub use dispatcher::{EventDispatcher, RedriveSummary};
pub use dlq::{DeadLetter, DeadLetterQueue};
pub use error::{SyncError, SyncResult};
pub use handler::{DataSyncHandler, Direction};
pub use mirror::{DirtyCheck, SnapshotMirror};
pub use registry::HandlerRegistry;
