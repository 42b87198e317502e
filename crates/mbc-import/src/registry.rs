use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tracing::info;

use crate::error::{ImportError, ImportResult};
use crate::strategy::{ImportStrategy, ProcessStrategy, RowPipeline, TablePipeline};

/// Row pipelines keyed by table name.
#[derive(Default)]
pub struct ImportRegistry {
    pipelines: RwLock<BTreeMap<String, Arc<dyn RowPipeline>>>,
}

impl ImportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: impl Into<String>, pipeline: Arc<dyn RowPipeline>) -> ImportResult<()> {
        let table = table.into();
        let mut pipelines = self
            .pipelines
            .write()
            .map_err(|_| ImportError::LockPoisoned("import registry"))?;
        if pipelines.contains_key(&table) {
            return Err(ImportError::DuplicateTable(table));
        }
        info!(table = %table, "import pipeline registered");
        pipelines.insert(table, pipeline);
        Ok(())
    }

    /// Register a typed strategy pair for `table`.
    pub fn register_strategies<I, P>(&self, table: impl Into<String>, import: I, process: P) -> ImportResult<()>
    where
        I: ImportStrategy,
        P: ProcessStrategy<Dto = I::Dto>,
    {
        self.register(table, Arc::new(TablePipeline::new(import, process)))
    }

    pub fn get(&self, table: &str) -> ImportResult<Arc<dyn RowPipeline>> {
        self.pipelines
            .read()
            .map_err(|_| ImportError::LockPoisoned("import registry"))?
            .get(table)
            .cloned()
            .ok_or_else(|| ImportError::UnknownTable(table.to_string()))
    }

    pub fn contains(&self, table: &str) -> bool {
        self.pipelines
            .read()
            .map(|p| p.contains_key(table))
            .unwrap_or(false)
    }

    /// Registered table names, sorted.
    pub fn tables(&self) -> Vec<String> {
        self.pipelines
            .read()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }
}
