use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use mbc_store::{CommandStore, Page, PartitionQuery, StoreError};
use mbc_stream::{ChangeEvent, ChangeFeed, DeliveryReport, FeedError};
use mbc_types::{
    derive_id, strip_version, CommandInput, CommandRecord, DataRecord, HistoryRecord,
    InvokeContext, PartialUpdate,
};

use crate::config::CommandConfig;
use crate::error::{CommandError, CommandResult};
use crate::projector::Projector;

/// How far a publish goes before returning.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    /// Project inline and wait for the sync handlers.
    Sync,
    /// Return once the command record and its change event are appended.
    #[default]
    Async,
}

/// Writer of the command log and reader of the projections.
pub struct CommandService {
    commands: Arc<dyn CommandStore>,
    projector: Arc<Projector>,
    feed: Arc<ChangeFeed>,
    config: CommandConfig,
    stripes: Vec<Mutex<()>>,
}

impl CommandService {
    pub fn new(
        commands: Arc<dyn CommandStore>,
        projector: Arc<Projector>,
        feed: Arc<ChangeFeed>,
        config: CommandConfig,
    ) -> Self {
        let stripes = (0..config.emit_stripes.max(1))
            .map(|_| Mutex::new(()))
            .collect();
        Self {
            commands,
            projector,
            feed,
            config,
            stripes,
        }
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    // ---- Writes ----

    pub async fn publish(
        &self,
        input: CommandInput,
        ctx: &InvokeContext,
        mode: PublishMode,
    ) -> CommandResult<CommandRecord> {
        match mode {
            PublishMode::Sync => self.publish_sync(input, ctx).await,
            PublishMode::Async => self.publish_async(input, ctx),
        }
    }

    /// Commit, project inline, and wait for the dispatcher if one is
    /// subscribed to the feed.
    pub async fn publish_sync(
        &self,
        input: CommandInput,
        ctx: &InvokeContext,
    ) -> CommandResult<CommandRecord> {
        // Subscribe before emitting so the report cannot be missed.
        let reports = (self.feed.subscriber_count() > 0).then(|| self.feed.reports());

        let record = self.commit(&input, ctx)?;
        self.projector.apply(&record)?;

        if let Some(reports) = reports {
            self.await_report(reports, record.clone()).await?;
        }
        Ok(record)
    }

    /// Commit and emit. Projection happens in the dispatcher.
    pub fn publish_async(
        &self,
        input: CommandInput,
        ctx: &InvokeContext,
    ) -> CommandResult<CommandRecord> {
        self.commit(&input, ctx)
    }

    /// Merge `update` onto the latest committed version and publish.
    pub async fn publish_partial_update(
        &self,
        update: PartialUpdate,
        ctx: &InvokeContext,
        mode: PublishMode,
    ) -> CommandResult<CommandRecord> {
        let id = derive_id(&update.pk, &update.sk);
        let latest = self
            .commands
            .latest(&id)?
            .ok_or_else(|| CommandError::NotFound(id.clone()))?;

        if let Some(expected) = update.version {
            if expected != latest.version {
                return Err(CommandError::VersionConflict {
                    id,
                    expected,
                    current: latest.version,
                });
            }
        }

        let input = update.merge_onto(&latest.to_data_record());
        self.publish(input, ctx, mode).await
    }

    fn commit(&self, input: &CommandInput, ctx: &InvokeContext) -> CommandResult<CommandRecord> {
        input.validate()?;
        let tenant_code = input.resolved_tenant()?;
        let id = input.id();

        let previous = match input.version {
            0 => None,
            v => self.commands.get(&id, v)?,
        };
        let record =
            CommandRecord::from_input(input, tenant_code, ctx, previous.as_ref(), Utc::now());

        // One writer per entity at a time, so the precheck below holds until
        // the feed commits.
        let _guard = self.stripe(&id)
            .lock()
            .map_err(|_| CommandError::LockPoisoned("commit stripe"))?;

        let current = self.commands.latest(&id)?.map_or(0, |r| r.version);
        if current != input.version {
            debug!(%id, expected = input.version, current, "version conflict");
            return Err(CommandError::VersionConflict {
                id,
                expected: input.version,
                current,
            });
        }

        let event = self.feed.emit_with(record, |record| {
            self.commands.put_next(record).map_err(|e| match e {
                StoreError::ConditionFailed { id, current, .. } => CommandError::VersionConflict {
                    id,
                    expected: input.version,
                    current,
                },
                other => other.into(),
            })
        })?;
        info!(
            id = %event.record.id,
            version = event.record.version,
            event = %event.id,
            source = %event.record.source,
            "command committed"
        );
        Ok(event.record)
    }

    /// Bring the command log in line with events recovered from the feed's
    /// WAL, before they are replayed.
    ///
    /// A logged event whose version is missing from the command log is
    /// appended to it. Returns the events that match the command log and are
    /// safe to replay. Events that conflict with it, or that do not follow
    /// its latest version, are dropped.
    pub fn reconcile(&self, events: Vec<ChangeEvent>) -> CommandResult<Vec<ChangeEvent>> {
        let total = events.len();
        let mut restored = 0;
        let mut replay = Vec::with_capacity(total);
        // Once one event of an entity is dropped, its later events are too.
        let mut diverged = HashSet::new();

        for event in events {
            let record = &event.record;
            if diverged.contains(&record.id) {
                continue;
            }
            match self.commands.get(&record.id, record.version)? {
                Some(stored) if stored == *record => replay.push(event),
                Some(_) => {
                    warn!(
                        id = %record.id,
                        version = record.version,
                        "logged event differs from the committed version; dropping it"
                    );
                    diverged.insert(record.id.clone());
                }
                None => match self.commands.put_next(record) {
                    Ok(()) => {
                        restored += 1;
                        replay.push(event);
                    }
                    Err(StoreError::ConditionFailed { current, .. }) => {
                        error!(
                            id = %record.id,
                            version = record.version,
                            current,
                            "logged event does not follow the command log; dropping it"
                        );
                        diverged.insert(record.id.clone());
                    }
                    Err(e) => return Err(e.into()),
                },
            }
        }

        info!(total, restored, replay = replay.len(), "command log reconciled with WAL");
        Ok(replay)
    }

    fn stripe(&self, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        &self.stripes[(hasher.finish() as usize) % self.stripes.len()]
    }

    async fn await_report(
        &self,
        mut reports: broadcast::Receiver<DeliveryReport>,
        record: CommandRecord,
    ) -> CommandResult<()> {
        let started = Instant::now();
        let wait = async {
            loop {
                match reports.recv().await {
                    Ok(report) if report.concerns(&record.id, record.version) => return Ok(report),
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, id = %record.id, "delivery reports lagged");
                    }
                    Err(RecvError::Closed) => return Err(FeedError::ReportsClosed),
                }
            }
        };

        match tokio::time::timeout(self.config.sync_timeout(), wait).await {
            Ok(Ok(report)) if report.is_success() => Ok(()),
            Ok(Ok(report)) => Err(CommandError::SyncHandler {
                record: Box::new(record),
                failures: report.failures,
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!(id = %record.id, version = record.version, waited_ms, "sync publish timed out");
                Err(CommandError::SyncTimeout {
                    record: Box::new(record),
                    waited_ms,
                })
            }
        }
    }

    // ---- Reads ----

    /// Latest projection of `(pk, sk)`. A version suffix on `sk` is ignored.
    pub fn get_item(&self, pk: &str, sk: &str) -> CommandResult<Option<DataRecord>> {
        Ok(self.projector.data().get(pk, strip_version(sk))?)
    }

    /// Latest committed version of `id`, whether or not it is projected yet.
    pub fn get_latest(&self, id: &str) -> CommandResult<Option<DataRecord>> {
        Ok(self.commands.latest(id)?.map(|r| r.to_data_record()))
    }

    pub fn get_version(
        &self,
        pk: &str,
        sk: &str,
        version: u64,
    ) -> CommandResult<Option<HistoryRecord>> {
        Ok(self.projector.history().get(&derive_id(pk, sk), version)?)
    }

    /// Every archived version of `(pk, sk)`, ascending.
    pub fn list_versions(&self, pk: &str, sk: &str) -> CommandResult<Vec<HistoryRecord>> {
        Ok(self.projector.history().list(&derive_id(pk, sk))?)
    }

    pub fn list_items_by_partition(
        &self,
        pk: &str,
        query: &PartitionQuery,
    ) -> CommandResult<Page<DataRecord>> {
        Ok(self.projector.data().list(pk, query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Duration;

    use mbc_store::{InMemoryCommandStore, InMemoryDataStore, InMemoryHistoryStore};
    use mbc_stream::{FeedConfig, HandlerFailure};
    use proptest::prelude::*;

    const PK: &str = "TEST#VERSION";
    const SK: &str = "item#1";

    fn service_with(config: CommandConfig) -> Arc<CommandService> {
        let projector = Arc::new(Projector::new(
            Arc::new(InMemoryDataStore::new()),
            Arc::new(InMemoryHistoryStore::new()),
        ));
        Arc::new(CommandService::new(
            Arc::new(InMemoryCommandStore::new()),
            projector,
            Arc::new(ChangeFeed::in_memory()),
            config,
        ))
    }

    fn service() -> Arc<CommandService> {
        service_with(CommandConfig::default())
    }

    fn input(expected: u64, name: &str) -> CommandInput {
        CommandInput::new(PK, SK, expected).with_name(name)
    }

    fn ctx() -> InvokeContext {
        InvokeContext::new("tester", "127.0.0.1")
    }

    #[tokio::test]
    async fn sequential_updates_produce_contiguous_versions() {
        let svc = service();
        let v1 = svc.publish_sync(input(0, "first"), &ctx()).await.unwrap();
        let v2 = svc.publish_sync(input(1, "second"), &ctx()).await.unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(v2.sk, "item#1@2");

        let item = svc.get_item(PK, SK).unwrap().unwrap();
        assert_eq!(item.version, 2);
        assert_eq!(item.name, "second");

        let versions: Vec<u64> = svc
            .list_versions(PK, SK)
            .unwrap()
            .iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(svc.get_version(PK, SK, 1).unwrap().unwrap().name, "first");
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts() {
        let svc = service();
        svc.publish_sync(input(0, "first"), &ctx()).await.unwrap();
        svc.publish_sync(input(1, "second"), &ctx()).await.unwrap();

        let err = svc.publish_sync(input(1, "stale"), &ctx()).await.unwrap_err();
        match err {
            CommandError::VersionConflict { expected, current, .. } => {
                assert_eq!((expected, current), (1, 2));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(svc.get_item(PK, SK).unwrap().unwrap().name, "second");
    }

    #[tokio::test]
    async fn skipping_ahead_conflicts() {
        let svc = service();
        let err = svc.publish_sync(input(4, "gap"), &ctx()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(svc.get_item(PK, SK).unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_commit() {
        let svc = service();
        let bad = CommandInput::new(PK, "item#1@3", 0);
        assert!(matches!(
            svc.publish_async(bad, &ctx()),
            Err(CommandError::InvalidInput(_))
        ));
        assert!(svc.get_latest(&derive_id(PK, SK)).unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_writers_have_exactly_one_winner() {
        let svc = service();
        svc.publish_sync(input(0, "base"), &ctx()).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                svc.publish_sync(input(1, &format!("writer-{i}")), &ctx()).await
            }));
        }
        let mut wins = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(rec) => {
                    assert_eq!(rec.version, 2);
                    wins += 1;
                }
                Err(e) if e.is_conflict() => conflicts += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((wins, conflicts), (1, 7));
    }

    #[tokio::test]
    async fn async_publish_emits_without_projecting() {
        let svc = service();
        let mut sub = svc.feed().subscribe().unwrap();
        let rec = svc.publish_async(input(0, "first"), &ctx()).unwrap();

        let event = sub.try_recv().unwrap();
        assert_eq!(event.record, rec);
        assert!(svc.get_item(PK, SK).unwrap().is_none());
        assert_eq!(svc.get_latest(&rec.id).unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn sync_publish_waits_for_successful_report() {
        let svc = service();
        let mut sub = svc.feed().subscribe().unwrap();
        let feed = svc.feed().clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                feed.report(DeliveryReport::success(&event));
            }
        });

        let rec = svc.publish_sync(input(0, "first"), &ctx()).await.unwrap();
        assert_eq!(rec.version, 1);
    }

    #[tokio::test]
    async fn sync_publish_surfaces_handler_failures() {
        let svc = service();
        let mut sub = svc.feed().subscribe().unwrap();
        let feed = svc.feed().clone();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                let mut report = DeliveryReport::success(&event);
                report.failures.push(HandlerFailure {
                    handler: "rds".into(),
                    error: "connection refused".into(),
                    attempts: 3,
                });
                feed.report(report);
            }
        });

        let err = svc.publish_sync(input(0, "first"), &ctx()).await.unwrap_err();
        match &err {
            CommandError::SyncHandler { record, failures } => {
                assert_eq!(record.version, 1);
                assert_eq!(failures[0].handler, "rds");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.committed_record().unwrap().version, 1);
        assert_eq!(svc.get_item(PK, SK).unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn sync_publish_times_out_but_stays_committed() {
        let svc = service_with(CommandConfig {
            sync_timeout_ms: 20,
            ..CommandConfig::default()
        });
        let _silent = svc.feed().subscribe().unwrap();

        let err = svc.publish_sync(input(0, "first"), &ctx()).await.unwrap_err();
        assert!(matches!(err, CommandError::SyncTimeout { .. }));
        assert_eq!(svc.get_latest(&derive_id(PK, SK)).unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn partial_update_merges_onto_latest() {
        let svc = service();
        svc.publish_sync(
            input(0, "first").with_attribute("price", 10).with_attribute("stock", 1),
            &ctx(),
        )
        .await
        .unwrap();

        let update = PartialUpdate::new(PK, SK).with_attribute("stock", 5);
        let rec = svc
            .publish_partial_update(update, &ctx(), PublishMode::Sync)
            .await
            .unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.name, "first");
        assert_eq!(rec.attributes["price"], 10);
        assert_eq!(rec.attributes["stock"], 5);
    }

    #[tokio::test]
    async fn partial_update_checks_expected_version() {
        let svc = service();
        svc.publish_sync(input(0, "first"), &ctx()).await.unwrap();
        svc.publish_sync(input(1, "second"), &ctx()).await.unwrap();

        let stale = PartialUpdate::new(PK, SK).at_version(1).with_attribute("x", 1);
        let err = svc
            .publish_partial_update(stale, &ctx(), PublishMode::Async)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let missing = PartialUpdate::new(PK, "nope");
        assert!(matches!(
            svc.publish_partial_update(missing, &ctx(), PublishMode::Async).await,
            Err(CommandError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn creation_audit_is_carried_forward() {
        let svc = service();
        let alice = InvokeContext::new("alice", "10.0.0.1");
        let bob = InvokeContext::new("bob", "10.0.0.2");
        svc.publish_sync(input(0, "first"), &alice).await.unwrap();
        let v2 = svc.publish_sync(input(1, "second"), &bob).await.unwrap();
        assert_eq!(v2.created_by, "alice");
        assert_eq!(v2.updated_by, "bob");
    }

    #[tokio::test]
    async fn partition_listing_pages_through_items() {
        let svc = service();
        for i in 0..5 {
            let cmd = CommandInput::new("PRODUCT#acme", format!("p{i}"), 0);
            svc.publish_sync(cmd, &ctx()).await.unwrap();
        }
        let first = svc
            .list_items_by_partition("PRODUCT#acme", &PartitionQuery::default().with_limit(3))
            .unwrap();
        assert_eq!(first.items.len(), 3);
        let cursor = first.cursor.clone().unwrap();
        let rest = svc
            .list_items_by_partition(
                "PRODUCT#acme",
                &PartitionQuery::default().with_limit(3).after(cursor),
            )
            .unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.is_last());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn any_write_sequence_keeps_versions_gap_free(expectations in proptest::collection::vec(0u64..6, 1..20)) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let svc = service();
                let mut latest = 0u64;
                for expected in expectations {
                    match svc.publish_sync(input(expected, "x"), &ctx()).await {
                        Ok(rec) => {
                            prop_assert_eq!(expected, latest);
                            latest = rec.version;
                        }
                        Err(CommandError::VersionConflict { current, .. }) => {
                            prop_assert_ne!(expected, latest);
                            prop_assert_eq!(current, latest);
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                let versions: HashSet<u64> = svc
                    .list_versions(PK, SK)
                    .unwrap()
                    .iter()
                    .map(|r| r.version)
                    .collect();
                prop_assert_eq!(versions, (1..=latest).collect::<HashSet<u64>>());
                Ok(())
            })?;
        }
    }

    #[tokio::test]
    async fn sync_timeout_respects_config() {
        let svc = service_with(CommandConfig {
            sync_timeout_ms: 1,
            ..CommandConfig::default()
        });
        assert_eq!(svc.config().sync_timeout(), Duration::from_millis(1));
    }

    fn durable_service(wal: &Path, commands: Arc<dyn CommandStore>) -> CommandService {
        let feed = ChangeFeed::open(FeedConfig {
            wal_path: Some(wal.to_path_buf()),
            ..FeedConfig::default()
        })
        .unwrap();
        let projector = Arc::new(Projector::new(
            Arc::new(InMemoryDataStore::new()),
            Arc::new(InMemoryHistoryStore::new()),
        ));
        CommandService::new(commands, projector, Arc::new(feed), CommandConfig::default())
    }

    #[tokio::test]
    async fn conflicts_are_not_logged() {
        let dir = tempfile::tempdir().unwrap();
        let svc = durable_service(&dir.path().join("feed.wal"), Arc::new(InMemoryCommandStore::new()));

        svc.publish_async(input(0, "first"), &ctx()).unwrap();
        assert!(svc.publish_async(input(0, "again"), &ctx()).unwrap_err().is_conflict());
        assert!(svc.publish_async(input(3, "ahead"), &ctx()).unwrap_err().is_conflict());

        let logged = svc.feed().recover().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].record.name, "first");
    }

    #[tokio::test]
    async fn reconcile_restores_the_command_log_from_the_wal() {
        let dir = tempfile::tempdir().unwrap();
        let wal = dir.path().join("feed.wal");
        {
            let before = durable_service(&wal, Arc::new(InMemoryCommandStore::new()));
            before.publish_async(input(0, "one"), &ctx()).unwrap();
            before.publish_async(input(1, "two"), &ctx()).unwrap();
        }

        let after = durable_service(&wal, Arc::new(InMemoryCommandStore::new()));
        let id = derive_id(PK, SK);
        assert!(after.get_latest(&id).unwrap().is_none());

        let replay = after.reconcile(after.feed().recover().unwrap()).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(after.get_latest(&id).unwrap().unwrap().name, "two");

        // A second pass finds everything already committed.
        assert_eq!(after.reconcile(after.feed().recover().unwrap()).unwrap().len(), 2);

        let next = after.publish_async(input(2, "three"), &ctx()).unwrap();
        assert_eq!(next.version, 3);
    }

    #[tokio::test]
    async fn reconcile_drops_a_diverged_entity() {
        let dir = tempfile::tempdir().unwrap();
        let wal = dir.path().join("feed.wal");
        {
            let before = durable_service(&wal, Arc::new(InMemoryCommandStore::new()));
            before.publish_async(input(0, "logged-1"), &ctx()).unwrap();
            before.publish_async(input(1, "logged-2"), &ctx()).unwrap();
        }

        // The command log already holds a different v1.
        let commands = Arc::new(InMemoryCommandStore::new());
        let other = CommandService::new(
            commands.clone(),
            Arc::new(Projector::new(
                Arc::new(InMemoryDataStore::new()),
                Arc::new(InMemoryHistoryStore::new()),
            )),
            Arc::new(ChangeFeed::in_memory()),
            CommandConfig::default(),
        );
        other.publish_async(input(0, "other-1"), &ctx()).unwrap();

        let after = durable_service(&wal, commands);
        let replay = after.reconcile(after.feed().recover().unwrap()).unwrap();
        assert!(replay.is_empty());

        let latest = after.get_latest(&derive_id(PK, SK)).unwrap().unwrap();
        assert_eq!((latest.version, latest.name.as_str()), (1, "other-1"));
    }

    #[tokio::test]
    async fn reconcile_drops_events_past_a_gap() {
        let dir = tempfile::tempdir().unwrap();
        let wal = dir.path().join("feed.wal");
        let svc = durable_service(&wal, Arc::new(InMemoryCommandStore::new()));
        svc.publish_async(input(0, "one"), &ctx()).unwrap();
        svc.publish_async(input(1, "two"), &ctx()).unwrap();

        // Only v2 survives in the log handed to a fresh command store.
        let tail: Vec<ChangeEvent> = svc
            .feed()
            .recover()
            .unwrap()
            .into_iter()
            .filter(|e| e.record.version == 2)
            .collect();
        let fresh = durable_service(&dir.path().join("other.wal"), Arc::new(InMemoryCommandStore::new()));
        assert!(fresh.reconcile(tail).unwrap().is_empty());
        assert!(fresh.get_latest(&derive_id(PK, SK)).unwrap().is_none());
    }
}
