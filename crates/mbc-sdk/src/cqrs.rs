use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use mbc_command::{CommandService, Projector, PublishMode, TenantSettingsCache};
use mbc_import::{
    export_csv, AttributeTableStrategy, CsvImportRequest, ImportJob, ImportOrchestrator,
    ImportRegistry, ImportStrategy, InMemoryJobStore, JobFailure, JobStatus, JobStore,
    LoggingCallback, ProcessStrategy, RowPipeline, SingleImportRequest, WorkflowCallback,
    ZipImportRequest,
};
use mbc_store::{
    CommandStore, DataStore, HistoryStore, InMemoryCommandStore, InMemoryDataStore,
    InMemoryHistoryStore, Page, PartitionQuery,
};
use mbc_stream::{ChangeFeed, HandlerFailure};
use mbc_sync::{
    DataSyncHandler, DeadLetter, DeadLetterQueue, EventDispatcher, HandlerRegistry, RedriveSummary,
};
use mbc_types::{CommandInput, CommandRecord, DataRecord, HistoryRecord, InvokeContext, PartialUpdate};

use crate::config::CqrsConfig;
use crate::error::SdkResult;

/// Assembles a [`Cqrs`] handle. Every backend defaults to its in-memory
/// implementation.
#[derive(Default)]
pub struct CqrsBuilder {
    config: CqrsConfig,
    commands: Option<Arc<dyn CommandStore>>,
    data: Option<Arc<dyn DataStore>>,
    history: Option<Arc<dyn HistoryStore>>,
    jobs: Option<Arc<dyn JobStore>>,
    callback: Option<Arc<dyn WorkflowCallback>>,
    handlers: Vec<Arc<dyn DataSyncHandler>>,
}

impl CqrsBuilder {
    pub fn config(mut self, config: CqrsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn command_store(mut self, store: Arc<dyn CommandStore>) -> Self {
        self.commands = Some(store);
        self
    }

    pub fn data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data = Some(store);
        self
    }

    pub fn history_store(mut self, store: Arc<dyn HistoryStore>) -> Self {
        self.history = Some(store);
        self
    }

    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.jobs = Some(store);
        self
    }

    pub fn workflow_callback(mut self, callback: Arc<dyn WorkflowCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Register a data-sync handler before the dispatcher starts, so that
    /// replayed WAL events reach it too.
    pub fn handler(mut self, handler: Arc<dyn DataSyncHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Wire the components and start the event dispatcher. Must be called
    /// inside a tokio runtime.
    pub fn build(self) -> SdkResult<Cqrs> {
        let config = self.config;

        let data = self.data.unwrap_or_else(|| Arc::new(InMemoryDataStore::new()));
        let history = self
            .history
            .unwrap_or_else(|| Arc::new(InMemoryHistoryStore::new()));
        let commands = self
            .commands
            .unwrap_or_else(|| Arc::new(InMemoryCommandStore::new()));

        let projector = Arc::new(Projector::new(data.clone(), history));
        let settings = Arc::new(TenantSettingsCache::new(data, config.settings.ttl()));
        projector.add_listener(settings.clone())?;

        let feed = Arc::new(ChangeFeed::open(config.feed.clone())?);
        let service = Arc::new(CommandService::new(
            commands,
            projector,
            feed.clone(),
            config.command.clone(),
        ));

        let registry = Arc::new(HandlerRegistry::new());
        for handler in self.handlers {
            registry.register(handler)?;
        }
        let dispatcher = EventDispatcher::start(
            service.clone(),
            registry,
            Arc::new(DeadLetterQueue::new()),
            config.dispatcher.clone(),
        )?;

        let imports = ImportOrchestrator::new(
            Arc::new(ImportRegistry::new()),
            self.jobs.unwrap_or_else(|| Arc::new(InMemoryJobStore::new())),
            self.callback.unwrap_or_else(|| Arc::new(LoggingCallback)),
            config.import.clone(),
        );

        info!(durable = feed.is_durable(), "cqrs core started");
        Ok(Cqrs {
            service,
            dispatcher,
            imports,
            settings,
            config,
        })
    }
}

/// Application handle over the command service, projections, data-sync
/// dispatcher and import orchestrator.
pub struct Cqrs {
    service: Arc<CommandService>,
    dispatcher: EventDispatcher,
    imports: ImportOrchestrator,
    settings: Arc<TenantSettingsCache>,
    config: CqrsConfig,
}

impl Cqrs {
    pub fn builder() -> CqrsBuilder {
        CqrsBuilder::default()
    }

    /// In-memory instance with default settings.
    pub fn in_memory() -> SdkResult<Self> {
        Self::builder().build()
    }

    pub fn service(&self) -> &Arc<CommandService> {
        &self.service
    }

    pub fn imports(&self) -> &ImportOrchestrator {
        &self.imports
    }

    pub fn config(&self) -> &CqrsConfig {
        &self.config
    }

    // ---- Commands ----

    pub async fn publish(
        &self,
        input: CommandInput,
        ctx: &InvokeContext,
        mode: PublishMode,
    ) -> SdkResult<CommandRecord> {
        Ok(self.service.publish(input, ctx, mode).await?)
    }

    pub async fn publish_partial_update(
        &self,
        update: PartialUpdate,
        ctx: &InvokeContext,
        mode: PublishMode,
    ) -> SdkResult<CommandRecord> {
        Ok(self.service.publish_partial_update(update, ctx, mode).await?)
    }

    // ---- Reads ----

    pub fn get_item(&self, pk: &str, sk: &str) -> SdkResult<Option<DataRecord>> {
        Ok(self.service.get_item(pk, sk)?)
    }

    pub fn get_latest(&self, id: &str) -> SdkResult<Option<DataRecord>> {
        Ok(self.service.get_latest(id)?)
    }

    pub fn get_version(&self, pk: &str, sk: &str, version: u64) -> SdkResult<Option<HistoryRecord>> {
        Ok(self.service.get_version(pk, sk, version)?)
    }

    pub fn list_versions(&self, pk: &str, sk: &str) -> SdkResult<Vec<HistoryRecord>> {
        Ok(self.service.list_versions(pk, sk)?)
    }

    pub fn list_items(&self, pk: &str, query: &PartitionQuery) -> SdkResult<Page<DataRecord>> {
        Ok(self.service.list_items_by_partition(pk, query)?)
    }

    /// Effective tenant setting, inheriting from the common tenant.
    pub fn setting(&self, tenant_code: &str, key: &str) -> SdkResult<Option<DataRecord>> {
        Ok(self.settings.get(tenant_code, key)?)
    }

    // ---- Data sync ----

    pub fn register_handler(&self, handler: Arc<dyn DataSyncHandler>) -> SdkResult<()> {
        Ok(self.dispatcher.registry().register(handler)?)
    }

    pub fn handler_names(&self) -> Vec<String> {
        self.dispatcher.registry().names()
    }

    pub fn dead_letters(&self) -> SdkResult<Vec<DeadLetter>> {
        Ok(self.dispatcher.dead_letters().entries()?)
    }

    pub async fn redrive_dead_letters(&self) -> SdkResult<RedriveSummary> {
        Ok(self.dispatcher.redrive_dead_letters().await?)
    }

    /// Invoke every handler's `down` for `record`.
    pub async fn rollback(&self, record: &CommandRecord) -> SdkResult<Vec<HandlerFailure>> {
        Ok(self.dispatcher.rollback(record).await?)
    }

    /// Change events not yet fully processed by the dispatcher.
    pub fn pending_events(&self) -> u64 {
        self.dispatcher.pending()
    }

    /// Wait until every emitted event has been projected and synced.
    pub async fn drain(&self) {
        self.dispatcher.drain().await;
    }

    /// Drain and stop the dispatcher.
    pub async fn shutdown(&self) -> SdkResult<()> {
        self.dispatcher.shutdown().await?;
        info!("cqrs core stopped");
        Ok(())
    }

    // ---- Imports ----

    pub fn register_import<I, P>(&self, table: &str, import: I, process: P) -> SdkResult<()>
    where
        I: ImportStrategy,
        P: ProcessStrategy<Dto = I::Dto>,
    {
        Ok(self.imports.registry().register_strategies(table, import, process)?)
    }

    pub fn register_import_pipeline(&self, table: &str, pipeline: Arc<dyn RowPipeline>) -> SdkResult<()> {
        Ok(self.imports.registry().register(table, pipeline)?)
    }

    /// Register a generic attribute table: `pk = {kind}#{tenant}`, `sk = code`.
    pub fn register_attribute_table(&self, table: &str, kind: &str, required: &[&str]) -> SdkResult<()> {
        let import = required
            .iter()
            .fold(AttributeTableStrategy::new(kind, self.service.clone()), |s, col| {
                s.require(*col)
            });
        let process = AttributeTableStrategy::new(kind, self.service.clone());
        self.register_import(table, import, process)
    }

    pub fn import_tables(&self) -> Vec<String> {
        self.imports.registry().tables()
    }

    pub async fn import_single(
        &self,
        request: SingleImportRequest,
        ctx: &InvokeContext,
    ) -> SdkResult<ImportJob> {
        Ok(self.imports.submit_single(request, ctx).await?)
    }

    pub async fn import_csv(&self, request: CsvImportRequest, ctx: &InvokeContext) -> SdkResult<ImportJob> {
        Ok(self.imports.submit_csv(request, ctx).await?)
    }

    pub async fn import_zip(&self, request: ZipImportRequest, ctx: &InvokeContext) -> SdkResult<ImportJob> {
        Ok(self.imports.submit_zip(request, ctx).await?)
    }

    pub fn job(&self, id: &str) -> SdkResult<Option<ImportJob>> {
        Ok(self.imports.job(id)?)
    }

    pub fn job_children(&self, id: &str) -> SdkResult<Vec<ImportJob>> {
        Ok(self.imports.children(id)?)
    }

    pub async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        error: Option<JobFailure>,
    ) -> SdkResult<ImportJob> {
        Ok(self.imports.update_status(id, status, error).await?)
    }

    pub async fn wait_for_job(&self, id: &str, timeout: Duration) -> SdkResult<ImportJob> {
        Ok(self.imports.wait_for(id, timeout).await?)
    }

    /// Export the live items of a partition as CSV.
    pub fn export_csv(&self, pk: &str, query: &PartitionQuery, columns: &[String]) -> SdkResult<String> {
        Ok(export_csv(&self.service, pk, query, columns)?)
    }
}
