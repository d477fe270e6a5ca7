//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use prescale_engine::db::MemoryRepository;
use prescale_engine::gateway::mock::{MockClientFactory, MockClusterApi, MockNodePoolApi};
use prescale_engine::gateway::NodePoolDefinition;
use prescale_engine::model::{
    ClusterRecord, DatacenterRecord, Event, EventStatus, ScheduledHpaTarget, TargetStatus,
};
use prescale_id::{ClusterId, DatacenterId, EventId, ScheduledHpaId};

pub fn cluster(hpa_api_version: Option<&str>) -> ClusterRecord {
    ClusterRecord {
        id: ClusterId::new(),
        name: "gke_proj_main_asia-southeast1".to_string(),
        server_endpoint: "10.0.0.1".to_string(),
        certificate: String::new(),
        hpa_api_version: hpa_api_version.map(str::to_string),
        datacenter: DatacenterRecord {
            id: DatacenterId::new(),
            name: "gcp-main".to_string(),
            credentials: serde_json::json!({"type": "access_token", "access_token": "ya29.test"}),
        },
    }
}

pub fn event(
    cluster_id: ClusterId,
    status: EventStatus,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    calculate_node_pool: bool,
) -> Event {
    Event {
        id: EventId::new(),
        name: "flash-sale".to_string(),
        start_time,
        end_time,
        status,
        message: String::new(),
        calculate_node_pool,
        cluster_id,
    }
}

pub fn target(event_id: EventId, namespace: &str, name: &str, min: Option<i32>, max: i32) -> ScheduledHpaTarget {
    ScheduledHpaTarget {
        id: ScheduledHpaId::new(),
        event_id,
        name: name.to_string(),
        namespace: namespace.to_string(),
        min_replicas: min,
        max_replicas: max,
        status: TargetStatus::Pending,
        message: String::new(),
    }
}

/// A registered cluster backed by mocks.
pub struct Harness {
    pub repo: Arc<MemoryRepository>,
    pub cluster_api: Arc<MockClusterApi>,
    pub node_pools: Arc<MockNodePoolApi>,
    pub clients: Arc<MockClientFactory>,
    pub cluster: ClusterRecord,
}

impl Harness {
    pub fn new(cluster_api: MockClusterApi, node_pools: MockNodePoolApi) -> Self {
        Self::with_cluster(cluster(Some("autoscaling/v2")), cluster_api, node_pools)
    }

    pub fn with_cluster(cluster: ClusterRecord, cluster_api: MockClusterApi, node_pools: MockNodePoolApi) -> Self {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert_cluster(cluster.clone());
        let cluster_api = Arc::new(cluster_api);
        let node_pools = Arc::new(node_pools);
        let clients = Arc::new(MockClientFactory::new(cluster_api.clone(), node_pools.clone()));
        Self {
            repo,
            cluster_api,
            node_pools,
            clients,
            cluster,
        }
    }

    /// A pending event starting in ten minutes and lasting an hour.
    pub fn pending_event(&self, calculate_node_pool: bool) -> Event {
        let start = Utc::now() + Duration::minutes(10);
        let event = event(
            self.cluster.id,
            EventStatus::Pending,
            start,
            start + Duration::hours(1),
            calculate_node_pool,
        );
        self.repo.insert_event(event.clone());
        event
    }

    pub fn add_target(&self, event: &Event, namespace: &str, name: &str, min: Option<i32>, max: i32) -> ScheduledHpaTarget {
        let target = target(event.id, namespace, name, min, max);
        self.repo.insert_target(target.clone());
        target
    }

    pub fn status(&self, event: &Event) -> (EventStatus, String) {
        let stored = self.repo.event(event.id).expect("event stored");
        (stored.status, stored.message)
    }

    pub fn target_status(&self, target: &ScheduledHpaTarget) -> (TargetStatus, String) {
        let stored = self
            .repo
            .targets(target.event_id)
            .into_iter()
            .find(|t| t.id == target.id)
            .expect("target stored");
        (stored.status, stored.message)
    }

    pub fn definitions(&self) -> Vec<NodePoolDefinition> {
        self.node_pools.list_definitions()
    }
}
