use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use mbc_command::CommandService;
use mbc_stream::{Backlog, ChangeEvent, ChangeFeed, DeliveryReport, HandlerFailure, Subscription};
use mbc_types::CommandRecord;

use crate::config::DispatcherConfig;
use crate::dlq::{DeadLetter, DeadLetterQueue};
use crate::error::{SyncError, SyncResult};
use crate::handler::{DataSyncHandler, Direction};
use crate::registry::HandlerRegistry;

/// Handler name used in reports when projection itself fails.
const PROJECTION: &str = "projection";

/// Outcome of [`EventDispatcher::redrive_dead_letters`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedriveSummary {
    pub redriven: usize,
    pub succeeded: usize,
    pub failed: usize,
}

struct Running {
    pump: JoinHandle<()>,
    lanes: Vec<JoinHandle<()>>,
    checkpointer: Option<JoinHandle<()>>,
}

/// State shared by the pump and every lane.
struct Core {
    service: Arc<CommandService>,
    registry: Arc<HandlerRegistry>,
    dlq: Arc<DeadLetterQueue>,
    config: DispatcherConfig,
}

/// Consumes the change feed and drives projection plus data-sync handlers.
pub struct EventDispatcher {
    core: Arc<Core>,
    backlog: Backlog,
    running: Mutex<Option<Running>>,
}

impl EventDispatcher {
    /// Subscribe to the service's feed, replay whatever its WAL still holds,
    /// and start the worker lanes.
    ///
    /// Recovered events are reconciled with the command log first, so the
    /// log never trails the projections built from the replay.
    pub fn start(
        service: Arc<CommandService>,
        registry: Arc<HandlerRegistry>,
        dlq: Arc<DeadLetterQueue>,
        config: DispatcherConfig,
    ) -> SyncResult<Self> {
        let feed = service.feed().clone();
        // Subscribe before reading the WAL so nothing falls between the two.
        let subscription = feed.subscribe()?;
        let backlog = subscription.backlog();
        let recovered = service.reconcile(feed.recover()?)?;

        let core = Arc::new(Core {
            service,
            registry,
            dlq,
            config,
        });

        let workers = core.config.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut lanes = Vec::with_capacity(workers);
        for lane in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            lanes.push(tokio::spawn(run_lane(lane, rx, core.clone(), backlog.clone())));
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "replaying recovered change events");
            backlog.add(recovered.len() as u64);
            for event in recovered {
                route(&senders, event, &backlog);
            }
        }

        let pump = tokio::spawn(run_pump(subscription, senders));
        let checkpointer = match core.config.checkpoint_interval() {
            Some(every) if feed.is_durable() => Some(tokio::spawn(run_checkpointer(
                feed,
                backlog.clone(),
                every,
            ))),
            _ => None,
        };

        info!(workers, handlers = core.registry.len(), "event dispatcher started");

        Ok(Self {
            core,
            backlog,
            running: Mutex::new(Some(Running {
                pump,
                lanes,
                checkpointer,
            })),
        })
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.core.registry
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterQueue> {
        &self.core.dlq
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Events delivered to the dispatcher but not yet fully processed.
    pub fn pending(&self) -> u64 {
        self.backlog.pending()
    }

    /// Wait until every event emitted so far has been processed.
    pub async fn drain(&self) {
        self.backlog.wait_idle().await;
    }

    /// Drain, stop the lanes, and checkpoint the feed's WAL.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.drain().await;

        let running = self
            .running
            .lock()
            .map_err(|_| SyncError::LockPoisoned("dispatcher state"))?
            .take()
            .ok_or(SyncError::NotRunning)?;

        if let Some(checkpointer) = running.checkpointer {
            checkpointer.abort();
            let _ = checkpointer.await;
        }

        // Dropping the pump drops the lane senders, so lanes finish their
        // queues and exit.
        running.pump.abort();
        let _ = running.pump.await;
        for lane in running.lanes {
            if let Err(e) = lane.await {
                warn!(error = %e, "dispatcher lane ended abnormally");
            }
        }

        let feed = self.core.service.feed();
        if self.backlog.pending() == 0 {
            feed.checkpoint_if_idle(&self.backlog)?;
        } else {
            warn!(
                pending = self.backlog.pending(),
                "events left unprocessed; WAL not checkpointed"
            );
        }
        info!("event dispatcher stopped");
        Ok(())
    }

    /// Invoke `down` on every handler for `record`, outside the feed.
    pub async fn rollback(&self, record: &CommandRecord) -> SyncResult<Vec<HandlerFailure>> {
        let event = ChangeEvent::new(0, record.clone());
        let handlers = self.core.registry.handlers()?;
        info!(id = %record.id, version = record.version, "rolling back sync handlers");
        Ok(self.core.fan_out(&event, Direction::Down, handlers).await)
    }

    /// Retry every dead-lettered delivery against the handler that failed it.
    /// Deliveries that fail again go back to the queue.
    pub async fn redrive_dead_letters(&self) -> SyncResult<RedriveSummary> {
        let letters = self.core.dlq.drain()?;
        let mut summary = RedriveSummary::default();

        for letter in letters {
            summary.redriven += 1;
            let Some(handler) = self.core.registry.get(&letter.handler)? else {
                warn!(handler = %letter.handler, "dead letter handler no longer registered");
                summary.failed += 1;
                self.core.dlq.push(letter)?;
                continue;
            };
            let failures = self
                .core
                .fan_out(&letter.event, letter.direction, vec![handler])
                .await;
            if failures.is_empty() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }

        info!(
            redriven = summary.redriven,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "dead letters redriven"
        );
        Ok(summary)
    }
}

impl Core {
    async fn process(&self, event: ChangeEvent) {
        let mut report = DeliveryReport::success(&event);

        if let Err(e) = self.service.projector().apply(&event.record) {
            error!(id = %event.record.id, version = event.record.version, error = %e, "projection failed");
            report.failures.push(HandlerFailure {
                handler: PROJECTION.into(),
                error: e.to_string(),
                attempts: 1,
            });
        }

        match self.registry.handlers() {
            Ok(handlers) => {
                let failures = self.fan_out(&event, Direction::of(&event), handlers).await;
                report.failures.extend(failures);
            }
            Err(e) => report.failures.push(HandlerFailure {
                handler: "registry".into(),
                error: e.to_string(),
                attempts: 0,
            }),
        }

        debug!(
            id = %event.record.id,
            version = event.record.version,
            failures = report.failures.len(),
            "event processed"
        );
        self.service.feed().report(report);
    }

    /// Run every handler concurrently with its own retry budget and
    /// dead-letter the ones that exhaust it.
    async fn fan_out(
        &self,
        event: &ChangeEvent,
        direction: Direction,
        handlers: Vec<Arc<dyn DataSyncHandler>>,
    ) -> Vec<HandlerFailure> {
        let tasks: Vec<(String, JoinHandle<Result<(), HandlerFailure>>)> = handlers
            .into_iter()
            .map(|handler| {
                let name = handler.name().to_string();
                let record = event.record.clone();
                let config = self.config.clone();
                let task = tokio::spawn(async move {
                    deliver(handler.as_ref(), &record, direction, &config).await
                });
                (name, task)
            })
            .collect();

        let mut failures = Vec::new();
        for (name, task) in tasks {
            let failure = match task.await {
                Ok(Ok(())) => continue,
                Ok(Err(failure)) => failure,
                Err(join_error) => HandlerFailure {
                    handler: name,
                    error: format!("handler task aborted: {join_error}"),
                    attempts: 1,
                },
            };
            let letter = DeadLetter {
                event: event.clone(),
                direction,
                handler: failure.handler.clone(),
                error: failure.error.clone(),
                attempts: failure.attempts,
                failed_at: Utc::now(),
            };
            if let Err(e) = self.dlq.push(letter) {
                error!(error = %e, "could not dead-letter event");
            }
            failures.push(failure);
        }
        failures
    }
}

/// Apply one record to one handler, retrying with backoff.
async fn deliver(
    handler: &dyn DataSyncHandler,
    record: &CommandRecord,
    direction: Direction,
    config: &DispatcherConfig,
) -> Result<(), HandlerFailure> {
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match direction.invoke(handler, record).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < max_attempts => {
                let delay = config.backoff.delay(attempt);
                warn!(
                    handler = handler.name(),
                    id = %record.id,
                    version = record.version,
                    attempt,
                    ?delay,
                    error = %e,
                    "sync handler failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(HandlerFailure {
                    handler: handler.name().to_string(),
                    error: e.to_string(),
                    attempts: attempt,
                })
            }
        }
    }
}

fn lane_of(id: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() as usize) % lanes
}

fn route(senders: &[mpsc::UnboundedSender<ChangeEvent>], event: ChangeEvent, backlog: &Backlog) {
    let lane = lane_of(event.entity_id(), senders.len());
    if senders[lane].send(event).is_err() {
        backlog.ack();
    }
}

async fn run_pump(mut subscription: Subscription, senders: Vec<mpsc::UnboundedSender<ChangeEvent>>) {
    let backlog = subscription.backlog();
    while let Some(event) = subscription.recv().await {
        route(&senders, event, &backlog);
    }
}

/// Compact the WAL every `every` while the dispatcher is idle.
async fn run_checkpointer(feed: Arc<ChangeFeed>, backlog: Backlog, every: Duration) {
    let mut ticks = tokio::time::interval(every);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticks.tick().await;
    loop {
        ticks.tick().await;
        match feed.checkpoint_if_idle(&backlog) {
            Ok(true) => debug!("periodic WAL checkpoint"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "periodic WAL checkpoint failed"),
        }
    }
}

async fn run_lane(
    lane: usize,
    mut rx: mpsc::UnboundedReceiver<ChangeEvent>,
    core: Arc<Core>,
    backlog: Backlog,
) {
    debug!(lane, "dispatcher lane started");
    while let Some(event) = rx.recv().await {
        core.process(event).await;
        backlog.ack();
    }
    debug!(lane, "dispatcher lane stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use mbc_command::{Backoff, CommandConfig, CommandError, Projector};
    use mbc_store::{InMemoryCommandStore, InMemoryDataStore, InMemoryHistoryStore};
    use mbc_stream::FeedConfig;
    use mbc_types::{CommandInput, InvokeContext};

    use crate::mirror::SnapshotMirror;

    /// Fails the first `fail_times` calls, then succeeds. Records every
    /// version it applied.
    struct Flaky {
        name: String,
        fail_times: u32,
        calls: AtomicU32,
        seen: Mutex<Vec<(String, u64, Direction)>>,
    }

    impl Flaky {
        fn new(name: &str, fail_times: u32) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                fail_times,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn record(&self, record: &CommandRecord, direction: Direction) -> SyncResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                return Err(SyncError::handler(&self.name, "unavailable"));
            }
            self.seen
                .lock()
                .unwrap()
                .push((record.id.clone(), record.version, direction));
            Ok(())
        }

        fn seen(&self) -> Vec<(String, u64, Direction)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataSyncHandler for Flaky {
        fn name(&self) -> &str {
            &self.name
        }

        async fn up(&self, record: &CommandRecord) -> SyncResult<()> {
            self.record(record, Direction::Up)
        }

        async fn down(&self, record: &CommandRecord) -> SyncResult<()> {
            self.record(record, Direction::Down)
        }
    }

    struct Harness {
        service: Arc<CommandService>,
        dispatcher: EventDispatcher,
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            workers: 4,
            max_attempts: 3,
            backoff: Backoff::new(1, 2),
            checkpoint_interval_ms: 0,
        }
    }

    fn service_over(feed: ChangeFeed, commands: Arc<InMemoryCommandStore>) -> Arc<CommandService> {
        let projector = Arc::new(Projector::new(
            Arc::new(InMemoryDataStore::new()),
            Arc::new(InMemoryHistoryStore::new()),
        ));
        Arc::new(CommandService::new(
            commands,
            projector,
            Arc::new(feed),
            CommandConfig::default(),
        ))
    }

    fn start(
        service: Arc<CommandService>,
        handlers: Vec<Arc<dyn DataSyncHandler>>,
        config: DispatcherConfig,
    ) -> Harness {
        let registry = Arc::new(HandlerRegistry::new());
        for h in handlers {
            registry.register(h).unwrap();
        }
        let dispatcher = EventDispatcher::start(
            service.clone(),
            registry,
            Arc::new(DeadLetterQueue::new()),
            config,
        )
        .unwrap();
        Harness { service, dispatcher }
    }

    fn harness_with(feed: ChangeFeed, handlers: Vec<Arc<dyn DataSyncHandler>>) -> Harness {
        start(
            service_over(feed, Arc::new(InMemoryCommandStore::new())),
            handlers,
            fast_config(),
        )
    }

    fn harness(handlers: Vec<Arc<dyn DataSyncHandler>>) -> Harness {
        harness_with(ChangeFeed::in_memory(), handlers)
    }

    fn cmd(sk: &str, expected: u64) -> CommandInput {
        CommandInput::new("PRODUCT#acme", sk, expected).with_attribute("rev", expected)
    }

    fn ctx() -> InvokeContext {
        InvokeContext::system("test")
    }

    #[tokio::test]
    async fn async_publishes_are_projected_and_delivered() {
        let handler = Flaky::new("rds", 0);
        let h = harness(vec![handler.clone()]);

        h.service.publish_async(cmd("p1", 0), &ctx()).unwrap();
        h.service.publish_async(cmd("p1", 1), &ctx()).unwrap();
        h.dispatcher.drain().await;

        let item = h.service.get_item("PRODUCT#acme", "p1").unwrap().unwrap();
        assert_eq!(item.version, 2);
        assert_eq!(h.service.list_versions("PRODUCT#acme", "p1").unwrap().len(), 2);
        assert_eq!(handler.seen().len(), 2);
    }

    #[tokio::test]
    async fn per_entity_order_is_preserved() {
        let handler = Flaky::new("rds", 0);
        let h = harness(vec![handler.clone()]);

        for entity in ["a", "b", "c"] {
            for v in 0..5 {
                h.service.publish_async(cmd(entity, v), &ctx()).unwrap();
            }
        }
        h.dispatcher.drain().await;

        for entity in ["a", "b", "c"] {
            let id = format!("PRODUCT#acme#{entity}");
            let versions: Vec<u64> = handler
                .seen()
                .into_iter()
                .filter(|(seen, _, _)| *seen == id)
                .map(|(_, v, _)| v)
                .collect();
            assert_eq!(versions, vec![1, 2, 3, 4, 5]);
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let handler = Flaky::new("rds", 2);
        let h = harness(vec![handler.clone()]);

        h.service.publish_sync(cmd("p1", 0), &ctx()).await.unwrap();
        assert_eq!(handler.seen().len(), 1);
        assert!(h.dispatcher.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn exhausted_handler_is_dead_lettered_in_isolation() {
        let healthy = Flaky::new("search", 0);
        let broken = Flaky::new("rds", u32::MAX);
        let h = harness(vec![healthy.clone(), broken.clone()]);

        let err = h.service.publish_sync(cmd("p1", 0), &ctx()).await.unwrap_err();
        match err {
            CommandError::SyncHandler { record, failures } => {
                assert_eq!(record.version, 1);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].handler, "rds");
                assert_eq!(failures[0].attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }

        // The healthy handler ran exactly once and the command stays committed.
        assert_eq!(healthy.seen().len(), 1);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 3);
        assert!(h.service.get_item("PRODUCT#acme", "p1").unwrap().is_some());

        let letters = h.dispatcher.dead_letters().entries().unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].handler, "rds");
        assert_eq!(letters[0].direction, Direction::Up);
    }

    #[tokio::test]
    async fn deleted_records_go_down() {
        let handler = Flaky::new("rds", 0);
        let h = harness(vec![handler.clone()]);

        h.service.publish_async(cmd("p1", 0), &ctx()).unwrap();
        h.service.publish_async(cmd("p1", 1).deleted(), &ctx()).unwrap();
        h.dispatcher.drain().await;

        let directions: Vec<Direction> = handler.seen().into_iter().map(|(_, _, d)| d).collect();
        assert_eq!(directions, vec![Direction::Up, Direction::Down]);
    }

    #[tokio::test]
    async fn rollback_invokes_down_on_every_handler() {
        let a = Flaky::new("a", 0);
        let b = Flaky::new("b", 0);
        let h = harness(vec![a.clone(), b.clone()]);

        let rec = h.service.publish_sync(cmd("p1", 0), &ctx()).await.unwrap();
        let failures = h.dispatcher.rollback(&rec).await.unwrap();
        assert!(failures.is_empty());
        assert_eq!(a.seen().last().unwrap().2, Direction::Down);
        assert_eq!(b.seen().last().unwrap().2, Direction::Down);
    }

    #[tokio::test]
    async fn redrive_retries_only_the_failed_handler() {
        let healthy = Flaky::new("search", 0);
        // Fails the three original attempts, then recovers.
        let flaky = Flaky::new("rds", 3);
        let h = harness(vec![healthy.clone(), flaky.clone()]);

        let _ = h.service.publish_sync(cmd("p1", 0), &ctx()).await;
        assert_eq!(h.dispatcher.dead_letters().len(), 1);

        let summary = h.dispatcher.redrive_dead_letters().await.unwrap();
        assert_eq!(summary, RedriveSummary { redriven: 1, succeeded: 1, failed: 0 });
        assert!(h.dispatcher.dead_letters().is_empty());
        assert_eq!(flaky.seen().len(), 1);
        assert_eq!(healthy.seen().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_harmless_for_the_mirror() {
        let mirror = Arc::new(SnapshotMirror::new("mirror"));
        let h = harness(vec![mirror.clone()]);

        let rec = h.service.publish_sync(cmd("p1", 0), &ctx()).await.unwrap();
        // Redeliver the same version directly.
        h.dispatcher.core.process(ChangeEvent::new(99, rec.clone())).await;

        assert_eq!(mirror.writes(), 1);
        assert_eq!(mirror.get(&rec.id).unwrap().unwrap().version, 1);
        assert_eq!(h.service.list_versions("PRODUCT#acme", "p1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wal_events_are_replayed_on_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = FeedConfig {
            wal_path: Some(dir.path().join("feed.wal")),
            ..FeedConfig::default()
        };

        // Commit without any dispatcher running.
        let feed = ChangeFeed::open(config.clone()).unwrap();
        let rec = {
            let input = cmd("p1", 0);
            let record = CommandRecord::from_input(&input, "acme".into(), &ctx(), None, Utc::now());
            feed.emit(record.clone()).unwrap();
            record
        };
        drop(feed);

        let handler = Flaky::new("rds", 0);
        let h = harness_with(ChangeFeed::open(config.clone()).unwrap(), vec![handler.clone()]);
        h.dispatcher.drain().await;
        assert_eq!(handler.seen(), vec![(rec.id.clone(), 1, Direction::Up)]);
        assert!(h.service.get_item("PRODUCT#acme", "p1").unwrap().is_some());
        assert_eq!(h.service.get_latest(&rec.id).unwrap().unwrap().version, 1);

        h.dispatcher.shutdown().await.unwrap();
        assert!(!h.dispatcher.is_running());
        assert!(ChangeFeed::open(config).unwrap().recover().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_twice_reports_not_running() {
        let h = harness(vec![]);
        h.dispatcher.shutdown().await.unwrap();
        assert!(matches!(
            h.dispatcher.shutdown().await,
            Err(SyncError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn drain_returns_when_idle() {
        let h = harness(vec![]);
        tokio::time::timeout(Duration::from_secs(1), h.dispatcher.drain())
            .await
            .unwrap();
        assert_eq!(h.dispatcher.pending(), 0);
    }
    #[tokio::test]
    async fn replay_skips_events_the_command_log_contradicts() {
        let dir = tempfile::tempdir().unwrap();
        let config = FeedConfig {
            wal_path: Some(dir.path().join("feed.wal")),
            ..FeedConfig::default()
        };
        {
            let feed = ChangeFeed::open(config.clone()).unwrap();
            let record = CommandRecord::from_input(&cmd("p1", 0), "acme".into(), &ctx(), None, Utc::now());
            feed.emit(record).unwrap();
        }

        // The command log already committed a different v1 for p1.
        let commands = Arc::new(InMemoryCommandStore::new());
        service_over(ChangeFeed::in_memory(), commands.clone())
            .publish_async(cmd("p1", 0).with_attribute("rev", "kept"), &ctx())
            .unwrap();

        let handler = Flaky::new("rds", 0);
        let h = start(
            service_over(ChangeFeed::open(config).unwrap(), commands),
            vec![handler.clone()],
            fast_config(),
        );
        h.dispatcher.drain().await;
        assert!(handler.seen().is_empty());
        assert!(h.service.get_item("PRODUCT#acme", "p1").unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_dispatcher_checkpoints_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let config = FeedConfig {
            wal_path: Some(dir.path().join("feed.wal")),
            ..FeedConfig::default()
        };
        let h = start(
            service_over(ChangeFeed::open(config).unwrap(), Arc::new(InMemoryCommandStore::new())),
            vec![],
            DispatcherConfig {
                checkpoint_interval_ms: 10,
                ..fast_config()
            },
        );

        h.service.publish_async(cmd("p1", 0), &ctx()).unwrap();
        h.service.publish_async(cmd("p2", 0), &ctx()).unwrap();
        h.dispatcher.drain().await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while !h.service.feed().recover().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("WAL was never compacted");
        assert!(h.dispatcher.is_running());
    }
}
