//! Foundation types for the MBC CQRS core.
//!
//! Every other `mbc-*` crate depends on `mbc-types`. It carries no I/O and no
//! async code: only the key conventions shared by the three tables and the
//! record shapes that flow between them.
//!
//! # Key Types
//!
//! - [`EntityKey`]: `(pk, sk)` pair with the tenant/version conventions
//! - [`CommandInput`]: a proposed write carrying the expected prior version
//! - [`CommandRecord`]: a committed version in the command log
//! - [`DataRecord`]: the latest-version projection of an entity
//! - [`InvokeContext`]: who/where a command came from (audit fields)

pub mod context;
pub mod error;
pub mod keys;
pub mod record;

pub use context::InvokeContext;
pub use error::TypeError;
pub use keys::{
    decode_tenant_code, derive_id, encode_partition_key, encode_sort_key, is_common_tenant,
    strip_version, version_of, with_version, EntityKey, VersionRef, COMMON_TENANT, KEY_SEPARATOR,
    VERSION_FIRST, VERSION_SEPARATOR,
};
pub use record::{
    Attributes, CommandInput, CommandRecord, DataRecord, HistoryRecord, PartialUpdate,
};
