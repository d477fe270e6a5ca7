//! Integration tests for the watcher and the scheduler loop.
//!
//! All tests run on paused tokio time; wall-clock timestamps on events are
//! only compared against once, when a watch or sweep starts.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{event, Harness};
use prescale_engine::db::Repository;
use prescale_engine::engine::EventExecutor;
use prescale_engine::gateway::mock::{self, MockClientFactory, MockClusterApi, MockNodePoolApi};
use prescale_engine::model::{Event, EventStatus, UpdatedNodePool};
use prescale_engine::scheduler::{SchedulerConfig, SchedulerWorker};
use prescale_engine::watcher::{EventWatcher, WatcherConfig};
use prescale_id::UpdatedNodePoolId;
use tokio::sync::watch;

fn shop_cluster() -> MockClusterApi {
    MockClusterApi::new()
        .with_node(mock::node("n1", "default", "8", "32Gi"))
        .with_node(mock::node("n2", "default", "8", "32Gi"))
        .with_node(mock::node("n3", "batch", "8", "32Gi"))
        .with_hpa(mock::hpa("shop", "web", 2, 10))
        .with_deployment(mock::deployment("shop", "web", Some(4), "10m", "32Mi", None))
}

fn watcher(harness: &Harness) -> EventWatcher {
    EventWatcher::new(
        harness.repo.clone(),
        harness.clients.clone(),
        WatcherConfig {
            interval: Duration::from_secs(30),
        },
    )
}

/// A prescaled event ending `ends_in` from now, tracking the default pool
/// and `shop/web`.
async fn prescaled_event(harness: &Harness, ends_in: chrono::Duration) -> Event {
    let now = Utc::now();
    let event = event(
        harness.cluster.id,
        EventStatus::Prescaled,
        now - chrono::Duration::minutes(1),
        now + ends_in,
        true,
    );
    harness.repo.insert_event(event.clone());
    harness.add_target(&event, "shop", "web", None, 10);
    harness
        .repo
        .insert_updated_node_pools(&[UpdatedNodePool {
            id: UpdatedNodePoolId::new(),
            event_id: event.id,
            node_pool_name: "default".to_string(),
            max_node: 9,
        }])
        .await
        .unwrap();
    event
}

#[tokio::test(start_paused = true)]
async fn test_watch_samples_until_end_then_sweep_succeeds() {
    let harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![]));
    let event = prescaled_event(&harness, chrono::Duration::seconds(65)).await;
    let (_tx, rx) = watch::channel(false);

    watcher(&harness).watch(event.clone(), rx).await;

    // Rounds at 30s and 60s; the 90s tick is past the end.
    let node_rows = harness.repo.node_pool_statuses();
    assert_eq!(node_rows.len(), 2);
    assert!(node_rows.iter().all(|row| row.node_count == 2));

    let hpa_rows = harness.repo.hpa_statuses();
    assert_eq!(hpa_rows.len(), 2);
    assert!(hpa_rows.iter().all(|row| row.replicas == 4 && row.ready_replicas == 4));

    assert_eq!(harness.status(&event).0, EventStatus::Watching);
    let moved = harness
        .repo
        .finish_watched(event.end_time + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(moved, vec![event.id]);
    assert_eq!(harness.status(&event).0, EventStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn test_sampling_failure_is_recorded_and_loop_continues() {
    let harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![]));
    harness.cluster_api.set_node_listing_fails(true);
    let event = prescaled_event(&harness, chrono::Duration::seconds(65)).await;
    let (_tx, rx) = watch::channel(false);

    watcher(&harness).watch(event.clone(), rx).await;

    assert!(harness.repo.node_pool_statuses().is_empty());
    assert_eq!(harness.repo.hpa_statuses().len(), 2);
    assert_eq!(harness.cluster_api.node_list_calls(), 2);
    let (status, message) = harness.status(&event);
    assert_eq!(status, EventStatus::Watching);
    assert!(
        message.starts_with("node pool sampling failed"),
        "unexpected message: {message}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_watch_requires_prescaled_event() {
    let harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![]));
    let event = harness.pending_event(true);
    let (_tx, rx) = watch::channel(false);

    watcher(&harness).watch(event.clone(), rx).await;

    assert_eq!(harness.status(&event).0, EventStatus::Pending);
    assert_eq!(harness.clients.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_watch() {
    let harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![]));
    let event = prescaled_event(&harness, chrono::Duration::hours(1)).await;
    let (tx, rx) = watch::channel(false);

    let watcher = Arc::new(watcher(&harness));
    let handle = tokio::spawn({
        let watcher = watcher.clone();
        let event = event.clone();
        async move { watcher.watch(event, rx).await }
    });

    tokio::time::sleep(Duration::from_secs(95)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(harness.repo.node_pool_statuses().len(), 3);
    assert_eq!(harness.status(&event).0, EventStatus::Watching);
}

#[tokio::test(start_paused = true)]
async fn test_setup_failure_message_survives_write_errors() {
    let mut harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![]));
    harness.clients = Arc::new(
        MockClientFactory::new(harness.cluster_api.clone(), harness.node_pools.clone()).failing("token revoked"),
    );
    let event = prescaled_event(&harness, chrono::Duration::hours(1)).await;
    harness.repo.fail_event_writes(2);
    let (_tx, rx) = watch::channel(false);

    watcher(&harness).watch(event.clone(), rx).await;

    assert_eq!(
        harness.status(&event),
        (
            EventStatus::Watching,
            "watch setup failed: credentials error: token revoked".to_string()
        )
    );
}

fn scheduler(harness: &Harness) -> SchedulerWorker {
    let executor = Arc::new(EventExecutor::new(harness.repo.clone(), harness.clients.clone()));
    let watcher = Arc::new(watcher(harness));
    SchedulerWorker::new(
        harness.repo.clone(),
        executor,
        watcher,
        SchedulerConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_drives_event_to_success() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![
            mock::node_pool("default", 110, 5),
            mock::node_pool("batch", 110, 2),
        ]),
    );
    // Window already over by wall clock, so the watch exits on its first
    // tick and the next sweep can finish the event.
    let now = Utc::now();
    let event = event(
        harness.cluster.id,
        EventStatus::Pending,
        now - chrono::Duration::minutes(5),
        now - chrono::Duration::seconds(1),
        true,
    );
    harness.repo.insert_event(event.clone());
    harness.add_target(&event, "shop", "web", None, 10);

    let worker = Arc::new(scheduler(&harness));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    // Ticks at 60s (execute), 120s (watch), 180s (sweep).
    tokio::time::sleep(Duration::from_secs(200)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(harness.status(&event).0, EventStatus::Success);
    assert_eq!(harness.repo.updated_node_pools().len(), 2);
    assert_eq!(harness.cluster_api.hpa_updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_waits_for_interrupted_execution() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![
            mock::node_pool("default", 30, 3),
            mock::node_pool("batch", 110, 2),
        ])
        .with_polls_until_done(u32::MAX),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 100);

    let worker = Arc::new(scheduler(&harness));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    tokio::time::sleep(Duration::from_secs(90)).await;
    assert_eq!(harness.status(&event).0, EventStatus::Executing);

    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(
        harness.status(&event),
        (EventStatus::Failed, "interrupted by shutdown".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_survives_query_errors() {
    let harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![]));
    let event = harness.pending_event(true);
    harness.repo.set_failing(true);

    let worker = Arc::new(scheduler(&harness));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run(rx).await }
    });

    tokio::time::sleep(Duration::from_secs(130)).await;
    harness.repo.set_failing(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    tx.send(true).unwrap();
    handle.await.unwrap();

    // Recovered on the third tick; no HPA targets, so the execution fails.
    assert_eq!(
        harness.status(&event),
        (EventStatus::Failed, "no hpa exist".to_string())
    );
}
