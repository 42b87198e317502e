use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use mbc_types::{CommandRecord, DataRecord, HistoryRecord};

use crate::error::{StoreError, StoreResult};
use crate::page::{Page, PartitionQuery};
use crate::traits::{CommandStore, DataStore, HistoryStore};

fn read<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> StoreResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| StoreError::LockPoisoned(name))
}

fn write<'a, T>(lock: &'a RwLock<T>, name: &'static str) -> StoreResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| StoreError::LockPoisoned(name))
}

// ---------------------------------------------------------------------------
// Command table
// ---------------------------------------------------------------------------

/// In-memory command log for tests and embedding.
///
/// Each entity's versions are held in a `Vec` where index `i` is version
/// `i + 1`, so the gap-free invariant is structural.
#[derive(Default)]
pub struct InMemoryCommandStore {
    streams: RwLock<HashMap<String, Vec<CommandRecord>>>,
}

impl InMemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct entities in the log.
    pub fn entity_count(&self) -> StoreResult<usize> {
        Ok(read(&self.streams, "command table")?.len())
    }
}

impl CommandStore for InMemoryCommandStore {
    fn put_next(&self, record: &CommandRecord) -> StoreResult<()> {
        let mut streams = write(&self.streams, "command table")?;
        let current = streams.get(&record.id).map_or(0, |s| s.len() as u64);
        if record.version != current + 1 {
            return Err(StoreError::ConditionFailed {
                id: record.id.clone(),
                attempted: record.version,
                current,
            });
        }
        streams.entry(record.id.clone()).or_default().push(record.clone());
        debug!(id = %record.id, version = record.version, "command appended");
        Ok(())
    }

    fn get(&self, id: &str, version: u64) -> StoreResult<Option<CommandRecord>> {
        if version == 0 {
            return Ok(None);
        }
        let streams = read(&self.streams, "command table")?;
        Ok(streams
            .get(id)
            .and_then(|s| s.get((version - 1) as usize))
            .cloned())
    }

    fn latest(&self, id: &str) -> StoreResult<Option<CommandRecord>> {
        let streams = read(&self.streams, "command table")?;
        Ok(streams.get(id).and_then(|s| s.last()).cloned())
    }

    fn versions(&self, id: &str) -> StoreResult<Vec<CommandRecord>> {
        let streams = read(&self.streams, "command table")?;
        Ok(streams.get(id).cloned().unwrap_or_default())
    }

    fn latest_version(&self, id: &str) -> StoreResult<u64> {
        let streams = read(&self.streams, "command table")?;
        Ok(streams.get(id).map_or(0, |s| s.len() as u64))
    }
}

// ---------------------------------------------------------------------------
// Data table
// ---------------------------------------------------------------------------

/// In-memory projection table, partitioned by `pk` and ordered by `sk`.
#[derive(Default)]
pub struct InMemoryDataStore {
    partitions: RwLock<HashMap<String, BTreeMap<String, DataRecord>>>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total rows across all partitions.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(read(&self.partitions, "data table")?
            .values()
            .map(BTreeMap::len)
            .sum())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl DataStore for InMemoryDataStore {
    fn get(&self, pk: &str, sk: &str) -> StoreResult<Option<DataRecord>> {
        let partitions = read(&self.partitions, "data table")?;
        Ok(partitions.get(pk).and_then(|p| p.get(sk)).cloned())
    }

    fn upsert(&self, record: &DataRecord) -> StoreResult<bool> {
        let mut partitions = write(&self.partitions, "data table")?;
        let partition = partitions.entry(record.pk.clone()).or_default();
        if let Some(existing) = partition.get(&record.sk) {
            if existing.version > record.version {
                debug!(
                    id = %record.id,
                    stored = existing.version,
                    incoming = record.version,
                    "stale projection skipped"
                );
                return Ok(false);
            }
        }
        partition.insert(record.sk.clone(), record.clone());
        Ok(true)
    }

    fn list(&self, pk: &str, query: &PartitionQuery) -> StoreResult<Page<DataRecord>> {
        let partitions = read(&self.partitions, "data table")?;
        let Some(partition) = partitions.get(pk) else {
            return Ok(Page::empty());
        };

        let start = match &query.cursor {
            Some(cursor) => Bound::Excluded(cursor.clone()),
            None => Bound::Unbounded,
        };
        let limit = query.limit.max(1);

        let mut items = Vec::new();
        let mut has_more = false;
        for (sk, record) in partition.range((start, Bound::Unbounded)) {
            if let Some(prefix) = &query.sk_prefix {
                if !sk.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            if record.is_deleted && !query.include_deleted {
                continue;
            }
            if items.len() == limit {
                has_more = true;
                break;
            }
            items.push(record.clone());
        }

        let cursor = if has_more {
            items.last().map(|r| r.sk.clone())
        } else {
            None
        };
        Ok(Page { items, cursor })
    }
}

// ---------------------------------------------------------------------------
// History table
// ---------------------------------------------------------------------------

/// In-memory write-once history table.
#[derive(Default)]
pub struct InMemoryHistoryStore {
    rows: RwLock<HashMap<String, BTreeMap<u64, HistoryRecord>>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn put_once(&self, record: &HistoryRecord) -> StoreResult<bool> {
        let mut rows = write(&self.rows, "history table")?;
        let versions = rows.entry(record.id.clone()).or_default();
        match versions.get(&record.version) {
            Some(existing) if existing == record => Ok(false),
            Some(_) => Err(StoreError::Immutable {
                id: record.id.clone(),
                version: record.version,
            }),
            None => {
                versions.insert(record.version, record.clone());
                Ok(true)
            }
        }
    }

    fn get(&self, id: &str, version: u64) -> StoreResult<Option<HistoryRecord>> {
        let rows = read(&self.rows, "history table")?;
        Ok(rows.get(id).and_then(|v| v.get(&version)).cloned())
    }

    fn list(&self, id: &str) -> StoreResult<Vec<HistoryRecord>> {
        let rows = read(&self.rows, "history table")?;
        Ok(rows
            .get(id)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default())
    }
}
