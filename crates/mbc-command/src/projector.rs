use std::sync::{Arc, RwLock};

use tracing::debug;

use mbc_store::{DataStore, HistoryStore, StoreError, StoreResult};
use mbc_types::CommandRecord;

/// Observer of projected versions.
pub trait CommitListener: Send + Sync {
    fn on_projected(&self, record: &CommandRecord);
}

/// What a projection pass wrote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Projection {
    /// `false` if the data row already held this or a newer version.
    pub data_written: bool,
    /// `false` if an identical history row already existed.
    pub history_written: bool,
}

/// Derives the Data and History rows from a committed version.
///
/// Applying the same record any number of times, in any order relative to
/// other versions of the same entity, leaves the tables in the same state.
pub struct Projector {
    data: Arc<dyn DataStore>,
    history: Arc<dyn HistoryStore>,
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
}

impl Projector {
    pub fn new(data: Arc<dyn DataStore>, history: Arc<dyn HistoryStore>) -> Self {
        Self {
            data,
            history,
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn data(&self) -> &Arc<dyn DataStore> {
        &self.data
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn add_listener(&self, listener: Arc<dyn CommitListener>) -> StoreResult<()> {
        self.listeners
            .write()
            .map_err(|_| StoreError::LockPoisoned("projector listeners"))?
            .push(listener);
        Ok(())
    }

    pub fn apply(&self, record: &CommandRecord) -> StoreResult<Projection> {
        let history_written = self.history.put_once(record)?;
        let data_written = self.data.upsert(&record.to_data_record())?;

        debug!(
            id = %record.id,
            version = record.version,
            data_written,
            history_written,
            "projected"
        );

        if data_written {
            let listeners = self
                .listeners
                .read()
                .map_err(|_| StoreError::LockPoisoned("projector listeners"))?;
            for listener in listeners.iter() {
                listener.on_projected(record);
            }
        }

        Ok(Projection {
            data_written,
            history_written,
        })
    }
}
