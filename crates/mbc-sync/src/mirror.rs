use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::debug;

use mbc_types::{Attributes, CommandRecord, DataRecord};

use crate::error::{SyncError, SyncResult};
use crate::handler::DataSyncHandler;

#[derive(Clone, Debug, PartialEq)]
struct Snapshot {
    code: String,
    name: String,
    kind: String,
    attributes: Attributes,
    is_deleted: bool,
}

impl From<&CommandRecord> for Snapshot {
    fn from(r: &CommandRecord) -> Self {
        Self {
            code: r.code.clone(),
            name: r.name.clone(),
            kind: r.kind.clone(),
            attributes: r.attributes.clone(),
            is_deleted: r.is_deleted,
        }
    }
}

/// Remembers the last applied business fields per entity so that a
/// downstream write can be skipped when nothing changed.
#[derive(Default)]
pub struct DirtyCheck {
    applied: RwLock<HashMap<String, Snapshot>>,
}

impl DirtyCheck {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if `record` differs from the last remembered snapshot of its
    /// entity, ignoring version and audit columns.
    pub fn is_dirty(&self, record: &CommandRecord) -> bool {
        self.applied
            .read()
            .map(|applied| applied.get(&record.id) != Some(&Snapshot::from(record)))
            .unwrap_or(true)
    }

    pub fn remember(&self, record: &CommandRecord) -> SyncResult<()> {
        self.applied
            .write()
            .map_err(|_| SyncError::LockPoisoned("dirty check"))?
            .insert(record.id.clone(), Snapshot::from(record));
        Ok(())
    }

    pub fn forget(&self, id: &str) -> SyncResult<()> {
        self.applied
            .write()
            .map_err(|_| SyncError::LockPoisoned("dirty check"))?
            .remove(id);
        Ok(())
    }
}

/// In-memory relational-style mirror of the latest entity state.
///
/// Stands in for an external read model in tests and local runs.
pub struct SnapshotMirror {
    name: String,
    rows: RwLock<BTreeMap<String, DataRecord>>,
    dirty: DirtyCheck,
    writes: AtomicU64,
}

impl SnapshotMirror {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            dirty: DirtyCheck::new(),
            writes: AtomicU64::new(0),
        }
    }

    pub fn get(&self, id: &str) -> SyncResult<Option<DataRecord>> {
        Ok(self
            .rows
            .read()
            .map_err(|_| SyncError::LockPoisoned("mirror rows"))?
            .get(id)
            .cloned())
    }

    /// Rows that are not marked deleted.
    pub fn live_rows(&self) -> SyncResult<Vec<DataRecord>> {
        Ok(self
            .rows
            .read()
            .map_err(|_| SyncError::LockPoisoned("mirror rows"))?
            .values()
            .filter(|r| !r.is_deleted)
            .cloned()
            .collect())
    }

    /// Number of row writes actually performed.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSyncHandler for SnapshotMirror {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, record: &CommandRecord) -> SyncResult<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| SyncError::LockPoisoned("mirror rows"))?;

        if let Some(existing) = rows.get(&record.id) {
            if existing.version > record.version {
                debug!(id = %record.id, stored = existing.version, incoming = record.version, "mirror skipped stale version");
                return Ok(());
            }
        }
        if !self.dirty.is_dirty(record) {
            debug!(id = %record.id, version = record.version, "mirror skipped unchanged record");
            return Ok(());
        }

        rows.insert(record.id.clone(), record.to_data_record());
        self.dirty.remember(record)?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn down(&self, record: &CommandRecord) -> SyncResult<()> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| SyncError::LockPoisoned("mirror rows"))?;
        if let Some(row) = rows.get_mut(&record.id) {
            if !row.is_deleted {
                row.is_deleted = true;
                row.version = row.version.max(record.version);
                self.writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        self.dirty.forget(&record.id)?;
        Ok(())
    }
}
