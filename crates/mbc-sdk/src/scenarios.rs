//! End-to-end behaviour of a fully wired [`Cqrs`] handle.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use mbc_command::Backoff;
use mbc_store::{InMemoryCommandStore, InMemoryDataStore, InMemoryHistoryStore};
use mbc_stream::FeedConfig;
use mbc_sync::{SyncError, SyncResult};

use crate::*;

fn ctx() -> InvokeContext {
    InvokeContext::new("alice", "10.0.0.1")
}

fn fast_config() -> CqrsConfig {
    let mut config = CqrsConfig::default();
    config.dispatcher.max_attempts = 2;
    config.dispatcher.backoff = Backoff::new(1, 2);
    config
}

/// Fails every delivery until switched healthy.
struct Switchable {
    healthy: AtomicBool,
    calls: AtomicU32,
}

impl Switchable {
    fn broken() -> Self {
        Self {
            healthy: AtomicBool::new(false),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl DataSyncHandler for Switchable {
    fn name(&self) -> &str {
        "switchable"
    }

    async fn up(&self, _record: &CommandRecord) -> SyncResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::handler("switchable", "downstream unavailable"))
        }
    }

    async fn down(&self, _record: &CommandRecord) -> SyncResult<()> {
        Ok(())
    }
}

#[tokio::test]
async fn create_update_then_stale_update_conflicts() {
    let cqrs = Cqrs::in_memory().unwrap();

    let v1 = cqrs
        .publish(
            CommandInput::new("TEST#VERSION", "item#1", 0).with_name("created"),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    assert_eq!(v1.version, 1);

    let v2 = cqrs
        .publish(
            CommandInput::new("TEST#VERSION", "item#1", 1).with_name("updated"),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let err = cqrs
        .publish(
            CommandInput::new("TEST#VERSION", "item#1", 1).with_name("late"),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap_err();
    assert_eq!(err.conflict_version(), Some(2));
    assert_eq!(cqrs.get_item("TEST#VERSION", "item#1").unwrap().unwrap().name, "updated");
}

#[tokio::test]
async fn concurrent_writers_on_one_version_single_winner() {
    let cqrs = Arc::new(Cqrs::in_memory().unwrap());
    cqrs.publish(CommandInput::new("TEST#VERSION", "race", 0), &ctx(), PublishMode::Async)
        .await
        .unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let cqrs = cqrs.clone();
            tokio::spawn(async move {
                cqrs.publish(
                    CommandInput::new("TEST#VERSION", "race", 1).with_attribute("writer", i),
                    &ctx(),
                    PublishMode::Async,
                )
                .await
            })
        })
        .collect();

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(record) => {
                winners += 1;
                assert_eq!(record.version, 2);
            }
            Err(e) => assert_eq!(e.conflict_version(), Some(2)),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn sequences_of_different_ids_are_independent() {
    let cqrs = Arc::new(Cqrs::in_memory().unwrap());
    let writers: Vec<_> = ["a", "b"]
        .into_iter()
        .map(|sk| {
            let cqrs = cqrs.clone();
            tokio::spawn(async move {
                for expected in 0..10 {
                    cqrs.publish(
                        CommandInput::new("ITEM#acme", sk, expected),
                        &ctx(),
                        PublishMode::Async,
                    )
                    .await
                    .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    cqrs.drain().await;
    for sk in ["a", "b"] {
        let versions: Vec<u64> = cqrs
            .list_versions("ITEM#acme", sk)
            .unwrap()
            .iter()
            .map(|h| h.version)
            .collect();
        assert_eq!(versions, (1..=10).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn projection_matches_commit_and_history_is_stable() {
    let cqrs = Cqrs::in_memory().unwrap();
    let v1 = cqrs
        .publish(
            CommandInput::new("PRODUCT#acme", "p1", 0)
                .with_name("Pen")
                .with_attribute("price", 10),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();

    let item = cqrs.get_item("PRODUCT#acme", "p1").unwrap().unwrap();
    assert_eq!(item.attributes, v1.attributes);
    assert_eq!(item.sk, "p1");
    assert_eq!(item.version, 1);

    let archived = cqrs.get_version("PRODUCT#acme", "p1", 1).unwrap().unwrap();
    for expected in 1..4 {
        cqrs.publish(
            CommandInput::new("PRODUCT#acme", "p1", expected).with_attribute("price", 10 + expected),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    }
    assert_eq!(cqrs.get_version("PRODUCT#acme", "p1", 1).unwrap().unwrap(), archived);
    assert_eq!(cqrs.get_item("PRODUCT#acme", "p1").unwrap().unwrap().attributes["price"], 13);
}

#[tokio::test]
async fn hundred_row_import_with_two_bad_rows() {
    let cqrs = Cqrs::in_memory().unwrap();
    cqrs.register_attribute_table("product", "PRODUCT", &["price"]).unwrap();

    let mut content = String::from("code,name,price\n");
    for row in 1..=100 {
        let price = if row == 50 || row == 75 { String::new() } else { row.to_string() };
        content.push_str(&format!("p{row},Product {row},{price}\n"));
    }

    let job = cqrs
        .import_csv(
            CsvImportRequest {
                table_name: "product".into(),
                tenant_code: "acme".into(),
                content,
                mode: ImportMode::Direct,
                task_token: None,
            },
            &ctx(),
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!((job.processed_rows, job.failed_rows), (100, 2));

    cqrs.drain().await;
    let items = cqrs
        .list_items("PRODUCT#acme", &PartitionQuery::default().with_limit(1_000))
        .unwrap();
    assert_eq!(items.items.len(), 98);

    let csv = cqrs
        .export_csv("PRODUCT#acme", &PartitionQuery::default(), &["price".to_string()])
        .unwrap();
    assert_eq!(csv.lines().count(), 99);
    assert!(csv.starts_with("pk,sk,code,name,version,price"));
}

#[tokio::test]
async fn redelivery_to_a_mirror_is_idempotent() {
    let mirror = Arc::new(SnapshotMirror::new("mirror"));
    let cqrs = Cqrs::builder().handler(mirror.clone()).build().unwrap();

    let record = cqrs
        .publish(
            CommandInput::new("PRODUCT#acme", "p1", 0).with_attribute("price", 10),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    let once = mirror.get(&record.id).unwrap();
    assert_eq!(mirror.writes(), 1);

    mirror.up(&record).await.unwrap();
    mirror.up(&record).await.unwrap();
    assert_eq!(mirror.get(&record.id).unwrap(), once);
    assert_eq!(mirror.writes(), 1);
}

#[tokio::test]
async fn wal_replay_after_restart_reaches_handlers_once_in_effect() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.feed = FeedConfig {
        wal_path: Some(dir.path().join("feed.wal")),
        ..FeedConfig::default()
    };

    let commands = Arc::new(InMemoryCommandStore::new());
    let data = Arc::new(InMemoryDataStore::new());
    let history = Arc::new(InMemoryHistoryStore::new());
    let mirror = Arc::new(SnapshotMirror::new("mirror"));

    let first = Cqrs::builder()
        .config(config.clone())
        .command_store(commands.clone())
        .data_store(data.clone())
        .history_store(history.clone())
        .handler(mirror.clone())
        .build()
        .unwrap();
    for sk in ["a", "b", "c"] {
        first
            .publish(CommandInput::new("ITEM#acme", sk, 0), &ctx(), PublishMode::Async)
            .await
            .unwrap();
    }
    first.drain().await;
    assert_eq!(mirror.writes(), 3);

    // No shutdown: the WAL still holds all three events.
    let second = Cqrs::builder()
        .config(config)
        .command_store(commands)
        .data_store(data)
        .history_store(history)
        .handler(mirror.clone())
        .build()
        .unwrap();
    second.drain().await;

    assert_eq!(mirror.writes(), 3);
    assert_eq!(mirror.live_rows().unwrap().len(), 3);
    assert_eq!(second.list_versions("ITEM#acme", "a").unwrap().len(), 1);
}

#[tokio::test]
async fn restart_without_shutdown_rebuilds_a_consistent_view() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.feed = FeedConfig {
        wal_path: Some(dir.path().join("feed.wal")),
        ..FeedConfig::default()
    };

    let crashed = Cqrs::builder().config(config.clone()).build().unwrap();
    crashed
        .publish(
            CommandInput::new("P#acme", "a", 0).with_name("one"),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    drop(crashed);

    // Every store starts empty again; only the WAL survived.
    let restarted = Cqrs::builder().config(config).build().unwrap();
    restarted.drain().await;

    let item = restarted.get_item("P#acme", "a").unwrap().unwrap();
    let latest = restarted.get_latest("P#acme#a").unwrap().unwrap();
    assert_eq!((item.version, latest.version), (1, 1));
    assert_eq!(latest.name, "one");

    let err = restarted
        .publish(CommandInput::new("P#acme", "a", 0), &ctx(), PublishMode::Sync)
        .await
        .unwrap_err();
    assert_eq!(err.conflict_version(), Some(1));

    let v2 = restarted
        .publish(
            CommandInput::new("P#acme", "a", 1).with_name("two"),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    assert_eq!(v2.version, 2);

    let history: Vec<String> = restarted
        .list_versions("P#acme", "a")
        .unwrap()
        .into_iter()
        .map(|h| h.name)
        .collect();
    assert_eq!(history, vec!["one", "two"]);
    assert_eq!(restarted.get_item("P#acme", "a").unwrap().unwrap().version, 2);
}

#[tokio::test]
async fn failing_handler_dead_letters_then_redrives() {
    let handler = Arc::new(Switchable::broken());
    let cqrs = Cqrs::builder()
        .config(fast_config())
        .handler(handler.clone())
        .build()
        .unwrap();

    let err = cqrs
        .publish(CommandInput::new("ITEM#acme", "x", 0), &ctx(), PublishMode::Sync)
        .await
        .unwrap_err();
    let SdkError::Command(CommandError::SyncHandler { record, failures }) = err else {
        panic!("expected a sync handler failure");
    };
    assert_eq!(record.version, 1);
    assert_eq!(failures[0].handler, "switchable");
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);

    // Committed and projected despite the downstream failure.
    assert!(cqrs.get_item("ITEM#acme", "x").unwrap().is_some());
    assert_eq!(cqrs.dead_letters().unwrap().len(), 1);

    handler.healthy.store(true, Ordering::SeqCst);
    let summary = cqrs.redrive_dead_letters().await.unwrap();
    assert_eq!((summary.redriven, summary.succeeded), (1, 1));
    assert!(cqrs.dead_letters().unwrap().is_empty());
}

#[tokio::test]
async fn settings_inherit_from_common_and_refresh_on_write() {
    let cqrs = Cqrs::in_memory().unwrap();
    let theme = |pk: &str, expected: u64, color: &str| {
        CommandInput::new(pk, "theme", expected).with_attribute("color", color)
    };

    cqrs.publish(theme("SETTING#common", 0, "blue"), &ctx(), PublishMode::Sync)
        .await
        .unwrap();
    let acme = cqrs.setting("acme", "theme").unwrap().unwrap();
    assert_eq!(acme.attributes["color"], json!("blue"));

    cqrs.publish(theme("SETTING#acme", 0, "red"), &ctx(), PublishMode::Sync)
        .await
        .unwrap();
    assert_eq!(cqrs.setting("acme", "theme").unwrap().unwrap().attributes["color"], "red");

    cqrs.publish(theme("SETTING#common", 1, "green"), &ctx(), PublishMode::Sync)
        .await
        .unwrap();
    assert_eq!(cqrs.setting("acme", "theme").unwrap().unwrap().attributes["color"], "red");
    assert_eq!(cqrs.setting("beta", "theme").unwrap().unwrap().attributes["color"], "green");
}

#[tokio::test]
async fn partial_update_merges_onto_latest() {
    let cqrs = Cqrs::in_memory().unwrap();
    cqrs.publish(
        CommandInput::new("PRODUCT#acme", "p1", 0)
            .with_name("Pen")
            .with_attribute("price", 10)
            .with_attribute("color", "black"),
        &ctx(),
        PublishMode::Sync,
    )
    .await
    .unwrap();

    let merged = cqrs
        .publish_partial_update(
            PartialUpdate::new("PRODUCT#acme", "p1").with_attribute("price", 12),
            &ctx(),
            PublishMode::Sync,
        )
        .await
        .unwrap();
    assert_eq!(merged.version, 2);
    assert_eq!(merged.name, "Pen");
    assert_eq!(merged.attributes["color"], "black");
    assert_eq!(merged.attributes["price"], 12);
}

#[tokio::test]
async fn shutdown_stops_the_dispatcher() {
    let cqrs = Cqrs::in_memory().unwrap();
    cqrs.publish(CommandInput::new("ITEM#acme", "a", 0), &ctx(), PublishMode::Async)
        .await
        .unwrap();
    cqrs.shutdown().await.unwrap();
    assert_eq!(cqrs.pending_events(), 0);
    assert!(cqrs.get_item("ITEM#acme", "a").unwrap().is_some());
    assert!(matches!(cqrs.shutdown().await, Err(SdkError::Sync(SyncError::NotRunning))));
}
