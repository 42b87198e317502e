use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{SyncError, SyncResult};
use crate::handler::DataSyncHandler;

/// Ordered set of data-sync handlers keyed by name.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<Vec<Arc<dyn DataSyncHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. Names must be unique.
    pub fn register(&self, handler: Arc<dyn DataSyncHandler>) -> SyncResult<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| SyncError::LockPoisoned("handler registry"))?;
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(SyncError::DuplicateHandler(handler.name().to_string()));
        }
        info!(handler = handler.name(), "data sync handler registered");
        handlers.push(handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> SyncResult<Option<Arc<dyn DataSyncHandler>>> {
        Ok(self
            .handlers
            .read()
            .map_err(|_| SyncError::LockPoisoned("handler registry"))?
            .iter()
            .find(|h| h.name() == name)
            .cloned())
    }

    /// Handlers in registration order.
    pub fn handlers(&self) -> SyncResult<Vec<Arc<dyn DataSyncHandler>>> {
        Ok(self
            .handlers
            .read()
            .map_err(|_| SyncError::LockPoisoned("handler registry"))?
            .clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.handlers
            .read()
            .map(|h| h.iter().map(|h| h.name().to_string()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.handlers.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
