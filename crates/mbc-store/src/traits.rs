use mbc_types::{CommandRecord, DataRecord, HistoryRecord};

use crate::error::StoreResult;
use crate::page::{Page, PartitionQuery};

/// Append-only version log.
///
/// Implementations must make [`CommandStore::put_next`] atomic with respect
/// to every other writer of the same `id`: of two concurrent writers at the
/// same version exactly one succeeds.
pub trait CommandStore: Send + Sync {
    /// Conditionally append `record`.
    ///
    /// Succeeds only if no record exists at `(record.id, record.version)`
    /// and `record.version` is exactly one past the latest stored version.
    /// Otherwise returns `StoreError::ConditionFailed` with the current
    /// version.
    fn put_next(&self, record: &CommandRecord) -> StoreResult<()>;

    /// Read one version. `Ok(None)` if it was never committed.
    fn get(&self, id: &str, version: u64) -> StoreResult<Option<CommandRecord>>;

    /// Highest committed version of `id`.
    fn latest(&self, id: &str) -> StoreResult<Option<CommandRecord>>;

    /// All versions of `id`, ascending.
    fn versions(&self, id: &str) -> StoreResult<Vec<CommandRecord>>;

    /// Current version number, `0` if the entity does not exist.
    fn latest_version(&self, id: &str) -> StoreResult<u64> {
        Ok(self.latest(id)?.map_or(0, |r| r.version))
    }
}

/// Latest-version projection table.
pub trait DataStore: Send + Sync {
    fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<DataRecord>>;

    /// Write `record` unless a newer version is already stored.
    ///
    /// Returns `true` if the row was written. Re-applying the stored
    /// version is allowed and idempotent.
    fn upsert(&self, record: &DataRecord) -> StoreResult<bool>;

    /// Rows of one partition in sort-key order.
    fn list(&self, pk: &str, query: &PartitionQuery) -> StoreResult<Page<DataRecord>>;
}

/// Write-once archive of every committed version.
pub trait HistoryStore: Send + Sync {
    /// Insert a history row.
    ///
    /// Returns `true` on first insert, `false` if an identical row already
    /// exists, and `StoreError::Immutable` if a different row exists.
    fn put_once(&self, record: &HistoryRecord) -> StoreResult<bool>;

    fn get(&self, id: &str, version: u64) -> StoreResult<Option<HistoryRecord>>;

    /// All archived versions of `id`, ascending.
    fn list(&self, id: &str) -> StoreResult<Vec<HistoryRecord>>;
}
