//! Table backends for the MBC CQRS core.
//!
//! Three logically distinct tables share one key convention
//! (see [`mbc_types::keys`]):
//!
//! - [`CommandStore`]: append-only version log; the only conditional write
//!   in the system lives here
//! - [`DataStore`]: one row per entity holding the latest version
//! - [`HistoryStore`]: write-once row per `(id, version)`
//!
//! # Design Rules
//!
//! 1. A command record is written only at `latest + 1`; anything else fails
//!    with [`StoreError::ConditionFailed`] carrying the current version.
//! 2. Data rows never regress to a lower version, so redelivered or
//!    reordered projections are harmless.
//! 3. History rows are never updated or deleted.
//! 4. Application code writes data/history only through the commit path in
//!    `mbc-command`; these traits are not a public write API.

pub mod error;
pub mod memory;
pub mod page;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::{InMemoryCommandStore, InMemoryDataStore, InMemoryHistoryStore};
pub use page::{Page, PartitionQuery};
pub use traits::{CommandStore, DataStore, HistoryStore};
