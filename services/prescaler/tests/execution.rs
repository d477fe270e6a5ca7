//! Integration tests for event execution.
//!
//! Drives `EventExecutor` against the in-memory repository and mock
//! cluster/node-pool APIs.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{cluster, Harness};
use prescale_engine::db::WriteRetry;
use prescale_engine::engine::EventExecutor;
use prescale_engine::gateway::mock::{self, MockClientFactory, MockClusterApi, MockNodePoolApi};
use prescale_engine::gateway::HpaOverride;
use prescale_engine::model::{EventStatus, TargetStatus};
use tokio::sync::watch;

/// Two nodes of a three-node pool fitting 30 pods each, running `shop/web`.
fn shop_cluster() -> MockClusterApi {
    MockClusterApi::new()
        .with_node(mock::node("n1", "default", "8", "32Gi"))
        .with_node(mock::node("n2", "default", "8", "32Gi"))
        .with_hpa(mock::hpa("shop", "web", 2, 10))
        .with_deployment(mock::deployment("shop", "web", Some(2), "10m", "32Mi", None))
}

fn executor(harness: &Harness) -> EventExecutor {
    EventExecutor::new(harness.repo.clone(), harness.clients.clone())
}

#[tokio::test(start_paused = true)]
async fn test_event_prescaled() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 30, 3)]),
    );
    let event = harness.pending_event(true);
    let web = harness.add_target(&event, "shop", "web", Some(20), 100);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event), (EventStatus::Prescaled, String::new()));
    assert_eq!(harness.target_status(&web).0, TargetStatus::Success);

    // 100 pods against 3 x 30: one more node plus the safety margin.
    let pools = harness.repo.updated_node_pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].node_pool_name, "default");
    assert_eq!(pools[0].max_node, 9);
    assert_eq!(harness.node_pools.set_calls()[0].1.max_node_count, 9);

    assert_eq!(
        harness.cluster_api.hpa_updates(),
        vec![(
            "shop/web".to_string(),
            HpaOverride {
                namespace: "shop".to_string(),
                name: "web".to_string(),
                min_replicas: Some(20),
                max_replicas: 100,
            }
        )]
    );
}

#[tokio::test]
async fn test_no_hpa_exist_has_no_side_effects() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 30, 3)]),
    );
    let event = harness.pending_event(true);
    let api = harness.add_target(&event, "shop", "api", None, 50);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(
        harness.status(&event),
        (EventStatus::Failed, "no hpa exist".to_string())
    );
    assert_eq!(
        harness.target_status(&api),
        (TargetStatus::Failed, "hpa not found".to_string())
    );
    assert!(harness.node_pools.set_calls().is_empty());
    assert!(harness.cluster_api.hpa_updates().is_empty());
    assert_eq!(harness.cluster_api.node_list_calls(), 0);
    assert!(harness.repo.updated_node_pools().is_empty());
}

#[tokio::test]
async fn test_missing_target_does_not_block_siblings() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 110, 5)]),
    );
    let event = harness.pending_event(true);
    let web = harness.add_target(&event, "shop", "web", None, 12);
    let ghost = harness.add_target(&event, "shop", "ghost", None, 12);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event).0, EventStatus::Prescaled);
    assert_eq!(harness.target_status(&web), (TargetStatus::Success, String::new()));
    assert_eq!(
        harness.target_status(&ghost),
        (TargetStatus::Failed, "hpa not found".to_string())
    );
    assert_eq!(harness.cluster_api.hpa_updates().len(), 1);
}

#[tokio::test]
async fn test_hpa_update_failure_is_per_target() {
    let cluster = shop_cluster()
        .with_hpa(mock::hpa("shop", "cart", 1, 4))
        .with_deployment(mock::deployment("shop", "cart", Some(1), "10m", "32Mi", None))
        .with_failing_update("shop/cart");
    let harness = Harness::new(cluster, MockNodePoolApi::new(vec![mock::node_pool("default", 110, 5)]));
    let event = harness.pending_event(true);
    let web = harness.add_target(&event, "shop", "web", None, 12);
    let cart = harness.add_target(&event, "shop", "cart", None, 8);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event).0, EventStatus::Prescaled);
    assert_eq!(harness.target_status(&web).0, TargetStatus::Success);
    let (status, message) = harness.target_status(&cart);
    assert_eq!(status, TargetStatus::Failed);
    assert!(message.contains("409"), "unexpected message: {message}");
}

#[tokio::test]
async fn test_without_node_pool_calculation() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 30, 3)]),
    );
    let event = harness.pending_event(false);
    harness.add_target(&event, "shop", "web", None, 100);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event).0, EventStatus::Prescaled);
    assert_eq!(harness.cluster_api.node_list_calls(), 0);
    assert!(harness.node_pools.set_calls().is_empty());
    let pools = harness.repo.updated_node_pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].max_node, 3);
    assert_eq!(harness.cluster_api.hpa_updates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_resize_fails_event_before_hpa_updates() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 30, 3)])
            .with_failing_pool("default", "quota exceeded"),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 100);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    let (status, message) = harness.status(&event);
    assert_eq!(status, EventStatus::Failed);
    assert!(message.contains("quota exceeded"), "unexpected message: {message}");
    assert!(harness.cluster_api.hpa_updates().is_empty());
    assert!(harness.repo.updated_node_pools().is_empty());
}

#[tokio::test]
async fn test_unknown_stored_hpa_version() {
    let harness = Harness::with_cluster(
        cluster(Some("autoscaling/v3")),
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 30, 3)]),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 10);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(
        harness.status(&event),
        (EventStatus::Failed, "hpa version unknown".to_string())
    );
}

#[tokio::test]
async fn test_missing_hpa_version_is_discovered() {
    let harness = Harness::with_cluster(
        cluster(None),
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 110, 5)]),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 10);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event).0, EventStatus::Prescaled);
}

#[tokio::test]
async fn test_connect_failure_fails_event() {
    let cluster_api = Arc::new(shop_cluster());
    let node_pools = Arc::new(MockNodePoolApi::new(vec![]));
    let mut harness = Harness::new(MockClusterApi::new(), MockNodePoolApi::new(vec![]));
    harness.clients = Arc::new(MockClientFactory::new(cluster_api, node_pools).failing("token revoked"));
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 10);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(
        harness.status(&event),
        (EventStatus::Failed, "credentials error: token revoked".to_string())
    );
}

#[tokio::test]
async fn test_claimed_event_is_skipped() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 110, 5)]),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 10);
    let executor = executor(&harness);
    let (_tx, rx) = watch::channel(false);

    // Two ticks racing on the same pending event.
    tokio::join!(
        executor.execute(event.clone(), rx.clone()),
        executor.execute(event.clone(), rx.clone()),
    );

    assert_eq!(harness.clients.connects(), 1);
    assert_eq!(harness.cluster_api.hpa_updates().len(), 1);
    assert_eq!(harness.status(&event).0, EventStatus::Prescaled);

    // A terminal event is never re-entered.
    executor.execute(event.clone(), rx).await;
    assert_eq!(harness.clients.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_execution() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 30, 3)]).with_polls_until_done(u32::MAX),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 100);
    let executor = Arc::new(executor(&harness));
    let (tx, rx) = watch::channel(false);

    let handle = tokio::spawn({
        let executor = executor.clone();
        let event = event.clone();
        async move { executor.execute(event, rx).await }
    });

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.status(&event).0, EventStatus::Executing);

    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(
        harness.status(&event),
        (EventStatus::Failed, "interrupted by shutdown".to_string())
    );
    assert!(harness.cluster_api.hpa_updates().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_outcome_write_is_retried() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 110, 5)]),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 10);
    harness.repo.fail_event_writes(2);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event), (EventStatus::Prescaled, String::new()));
}

#[tokio::test(start_paused = true)]
async fn test_outcome_write_gives_up_after_attempts() {
    let harness = Harness::new(
        shop_cluster(),
        MockNodePoolApi::new(vec![mock::node_pool("default", 110, 5)]),
    );
    let event = harness.pending_event(true);
    harness.add_target(&event, "shop", "web", None, 10);
    harness.repo.fail_event_writes(3);
    let (_tx, rx) = watch::channel(false);

    executor(&harness)
        .with_write_retry(WriteRetry {
            attempts: 3,
            ..Default::default()
        })
        .execute(event.clone(), rx)
        .await;

    // Left for manual recovery; the HPA work itself went through.
    assert_eq!(harness.status(&event).0, EventStatus::Executing);
    assert_eq!(harness.cluster_api.hpa_updates().len(), 1);
}

#[tokio::test]
async fn test_disabled_autoscaling_pool_records_configured_bound() {
    let mut pool = mock::node_pool("default", 30, 7);
    if let Some(autoscaling) = pool.autoscaling.as_mut() {
        autoscaling.enabled = false;
    }
    let harness = Harness::new(shop_cluster(), MockNodePoolApi::new(vec![pool]));
    let event = harness.pending_event(false);
    harness.add_target(&event, "shop", "web", None, 100);
    let (_tx, rx) = watch::channel(false);

    executor(&harness).execute(event.clone(), rx).await;

    assert_eq!(harness.status(&event).0, EventStatus::Prescaled);
    let pools = harness.repo.updated_node_pools();
    assert_eq!(pools.len(), 1);
    assert_eq!(pools[0].max_node, 7);
}
