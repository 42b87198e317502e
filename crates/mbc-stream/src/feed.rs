use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use mbc_types::CommandRecord;

use crate::error::{FeedError, Result};
use crate::event::{ChangeEvent, DeliveryReport};
use crate::wal::{WalConfig, WriteAheadLog};

/// Configuration for the [`ChangeFeed`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// WAL location. `None` keeps the feed purely in memory.
    pub wal_path: Option<PathBuf>,
    pub wal: WalConfig,
    /// Capacity of the delivery report broadcast channel.
    pub report_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            wal_path: None,
            wal: WalConfig::default(),
            report_capacity: 1024,
        }
    }
}

/// Count of events handed to a subscriber but not yet acknowledged.
///
/// Cloneable so that acknowledgements can come from whichever task finished
/// the work.
#[derive(Clone)]
pub struct Backlog {
    pending: Arc<watch::Sender<u64>>,
}

impl Backlog {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            pending: Arc::new(tx),
        }
    }

    pub fn add(&self, n: u64) {
        self.pending.send_modify(|p| *p += n);
    }

    /// Acknowledge one fully processed event.
    pub fn ack(&self) {
        self.pending.send_modify(|p| *p = p.saturating_sub(1));
    }

    pub fn pending(&self) -> u64 {
        *self.pending.borrow()
    }

    /// Wait until every delivered event has been acknowledged.
    pub async fn wait_idle(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|p| *p == 0).await;
    }
}

/// Consumer end of a feed subscription.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    backlog: Backlog,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn backlog(&self) -> Backlog {
        self.backlog.clone()
    }
}

struct Subscriber {
    sender: mpsc::UnboundedSender<ChangeEvent>,
    backlog: Backlog,
}

struct FeedState {
    next_seq: u64,
    subscribers: Vec<Subscriber>,
}

/// Ordered, at-least-once change feed.
///
/// Emission is serialized: an event is logged, its record committed, and the
/// event delivered before the next emission starts. Per-entity order
/// therefore equals version order, and the WAL order equals commit order.
pub struct ChangeFeed {
    wal: Option<WriteAheadLog>,
    state: Mutex<FeedState>,
    reports: broadcast::Sender<DeliveryReport>,
}

impl ChangeFeed {
    /// Open a feed, creating or reopening its WAL if configured.
    pub fn open(config: FeedConfig) -> Result<Self> {
        let wal = match &config.wal_path {
            Some(path) => Some(WriteAheadLog::open(path, config.wal.clone())?),
            None => None,
        };
        let next_seq = match &wal {
            Some(w) => w.recover()?.iter().map(|e| e.seq).max().map_or(1, |s| s + 1),
            None => 1,
        };
        info!(wal = ?config.wal_path, next_seq, "change feed opened");
        Ok(Self::with_wal(wal, next_seq, config.report_capacity))
    }

    /// A feed with no WAL.
    pub fn in_memory() -> Self {
        Self::with_wal(None, 1, FeedConfig::default().report_capacity)
    }

    fn with_wal(wal: Option<WriteAheadLog>, next_seq: u64, report_capacity: usize) -> Self {
        let (reports, _) = broadcast::channel(report_capacity.max(1));
        Self {
            wal,
            state: Mutex::new(FeedState {
                next_seq,
                subscribers: Vec::new(),
            }),
            reports,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, FeedState>> {
        self.state
            .lock()
            .map_err(|_| FeedError::LockPoisoned("feed state"))
    }

    /// Log the event for `record`, run `commit`, then deliver the event.
    ///
    /// Nothing is committed when the WAL append fails, and nothing is
    /// delivered when `commit` fails. Once `commit` succeeds delivery cannot
    /// fail.
    pub fn emit_with<E, F>(&self, record: CommandRecord, commit: F) -> std::result::Result<ChangeEvent, E>
    where
        E: From<FeedError>,
        F: FnOnce(&CommandRecord) -> std::result::Result<(), E>,
    {
        let mut state = self.lock()?;
        let event = ChangeEvent::new(state.next_seq, record);

        if let Some(wal) = &self.wal {
            wal.append(&event)?;
        }
        state.next_seq += 1;

        if let Err(e) = commit(&event.record) {
            if self.wal.is_some() {
                warn!(
                    seq = event.seq,
                    entity = %event.record.id,
                    version = event.record.version,
                    "commit failed after its event was logged"
                );
            }
            return Err(e);
        }

        state.subscribers.retain(|sub| {
            sub.backlog.add(1);
            if sub.sender.send(event.clone()).is_ok() {
                true
            } else {
                sub.backlog.ack();
                false
            }
        });

        debug!(id = %event.id, seq = event.seq, entity = %event.record.id, version = event.record.version, kind = %event.kind, "change emitted");
        Ok(event)
    }

    /// Log and deliver an event for a record committed elsewhere.
    pub fn emit(&self, record: CommandRecord) -> Result<ChangeEvent> {
        self.emit_with(record, |_| Ok::<(), FeedError>(()))
    }

    /// Register a consumer. Every event emitted afterwards is delivered to it.
    pub fn subscribe(&self) -> Result<Subscription> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let backlog = Backlog::new();
        self.lock()?.subscribers.push(Subscriber {
            sender,
            backlog: backlog.clone(),
        });
        Ok(Subscription { receiver, backlog })
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lock()
            .map(|state| state.subscribers.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    /// Events still in the WAL.
    pub fn recover(&self) -> Result<Vec<ChangeEvent>> {
        match &self.wal {
            Some(wal) => {
                let events = wal.recover()?;
                info!(count = events.len(), "recovered change events from WAL");
                Ok(events)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Compact the WAL when `backlog` has nothing outstanding.
    ///
    /// Runs under the emission lock, so no event can be logged between the
    /// idle check and the compaction. Returns whether a checkpoint was taken.
    pub fn checkpoint_if_idle(&self, backlog: &Backlog) -> Result<bool> {
        let Some(wal) = &self.wal else {
            return Ok(false);
        };
        let state = self.lock()?;
        if backlog.pending() > 0 {
            return Ok(false);
        }
        wal.compact(state.next_seq.saturating_sub(1))?;
        Ok(true)
    }

    /// Publish the outcome of processing an event.
    pub fn report(&self, report: DeliveryReport) {
        // No receivers simply means nobody is waiting synchronously.
        let _ = self.reports.send(report);
    }

    pub fn reports(&self) -> broadcast::Receiver<DeliveryReport> {
        self.reports.subscribe()
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }
}
