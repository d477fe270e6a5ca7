//! In-memory gateway implementations for testing and dry runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Container, Node, NodeStatus, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::gke::{ClusterLocation, NodePoolAutoscaling, NodePoolDefinition, Operation, OperationError};
use super::hpa::{HorizontalPodAutoscaler, HpaVersion, ScaleTargetRef, MINIMUM_REPLICAS};
use super::{ClientFactory, ClusterApi, Gateway, GatewayError, HpaOverride, NodePoolApi, NODE_POOL_LABEL};
use crate::model::ClusterRecord;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ClusterState {
    hpas: Vec<HorizontalPodAutoscaler>,
    deployments: Vec<Deployment>,
    daemon_sets: Vec<DaemonSet>,
    nodes: Vec<Node>,
    hpa_updates: Vec<(String, HpaOverride)>,
    failing_updates: HashSet<String>,
    fail_node_listing: bool,
    node_list_calls: usize,
    deployment_gets: usize,
}

/// Cluster API over fixed objects. Records every HPA update.
pub struct MockClusterApi {
    version: HpaVersion,
    state: Mutex<ClusterState>,
}

impl Default for MockClusterApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockClusterApi {
    pub fn new() -> Self {
        Self {
            version: HpaVersion::V2,
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn with_hpa(self, hpa: HorizontalPodAutoscaler) -> Self {
        lock(&self.state).hpas.push(hpa);
        self
    }

    pub fn with_deployment(self, deployment: Deployment) -> Self {
        lock(&self.state).deployments.push(deployment);
        self
    }

    pub fn with_daemon_set(self, daemon_set: DaemonSet) -> Self {
        lock(&self.state).daemon_sets.push(daemon_set);
        self
    }

    pub fn with_node(self, node: Node) -> Self {
        lock(&self.state).nodes.push(node);
        self
    }

    /// Updates to `namespace/name` fail with a conflict.
    pub fn with_failing_update(self, key: &str) -> Self {
        lock(&self.state).failing_updates.insert(key.to_string());
        self
    }

    pub fn set_node_listing_fails(&self, fails: bool) {
        lock(&self.state).fail_node_listing = fails;
    }

    /// `(namespace/name, override)` for every successful update, in order.
    pub fn hpa_updates(&self) -> Vec<(String, HpaOverride)> {
        lock(&self.state).hpa_updates.clone()
    }

    pub fn node_list_calls(&self) -> usize {
        lock(&self.state).node_list_calls
    }

    /// Single-deployment reads; listings are not counted.
    pub fn deployment_gets(&self) -> usize {
        lock(&self.state).deployment_gets
    }
}

fn in_namespace(meta: &ObjectMeta, namespace: Option<&str>) -> bool {
    namespace.is_none_or(|ns| meta.namespace.as_deref() == Some(ns))
}

/// Supports `key=value` selectors, which is all the gateway issues.
fn label_selected(meta: &ObjectMeta, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    let Some((key, value)) = selector.split_once('=') else {
        return false;
    };
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .is_some_and(|v| v == value)
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn list_namespaces(&self) -> Result<Vec<String>, GatewayError> {
        let state = lock(&self.state);
        let namespaces: std::collections::BTreeSet<String> =
            state.hpas.iter().map(|h| h.namespace.clone()).collect();
        Ok(namespaces.into_iter().collect())
    }

    async fn list_hpas(&self, version: HpaVersion) -> Result<Vec<HorizontalPodAutoscaler>, GatewayError> {
        if version != self.version {
            return Err(GatewayError::UnknownHpaVersion(version.to_string()));
        }
        Ok(lock(&self.state).hpas.clone())
    }

    async fn update_hpa(
        &self,
        version: HpaVersion,
        hpa_override: &HpaOverride,
    ) -> Result<HorizontalPodAutoscaler, GatewayError> {
        if version != self.version {
            return Err(GatewayError::UnknownHpaVersion(version.to_string()));
        }
        let key = format!("{}/{}", hpa_override.namespace, hpa_override.name);
        let mut state = lock(&self.state);
        if state.failing_updates.contains(&key) {
            return Err(GatewayError::Api {
                operation: "update hpa",
                status: 409,
                body: format!("conflict updating {key}"),
            });
        }

        let hpa = state
            .hpas
            .iter_mut()
            .find(|h| h.key() == key)
            .ok_or_else(|| GatewayError::HpaNotFound {
                namespace: hpa_override.namespace.clone(),
                name: hpa_override.name.clone(),
            })?;
        hpa.min_replicas = hpa_override.min_replicas.unwrap_or(MINIMUM_REPLICAS);
        hpa.max_replicas = hpa_override.max_replicas;
        let updated = hpa.clone();
        state.hpa_updates.push((key, hpa_override.clone()));
        Ok(updated)
    }

    async fn list_deployments(&self, namespace: Option<&str>) -> Result<Vec<Deployment>, GatewayError> {
        Ok(lock(&self.state)
            .deployments
            .iter()
            .filter(|d| in_namespace(&d.metadata, namespace))
            .cloned()
            .collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, GatewayError> {
        let mut state = lock(&self.state);
        state.deployment_gets += 1;
        state
            .deployments
            .iter()
            .find(|d| {
                d.metadata.namespace.as_deref() == Some(namespace)
                    && d.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .ok_or_else(|| GatewayError::DeploymentNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_daemon_sets(&self, namespace: Option<&str>) -> Result<Vec<DaemonSet>, GatewayError> {
        Ok(lock(&self.state)
            .daemon_sets
            .iter()
            .filter(|d| in_namespace(&d.metadata, namespace))
            .cloned()
            .collect())
    }

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>, GatewayError> {
        let mut state = lock(&self.state);
        state.node_list_calls += 1;
        if state.fail_node_listing {
            return Err(GatewayError::Api {
                operation: "list nodes",
                status: 503,
                body: "apiserver unavailable".to_string(),
            });
        }
        Ok(state
            .nodes
            .iter()
            .filter(|n| label_selected(&n.metadata, label_selector))
            .cloned()
            .collect())
    }

    async fn latest_hpa_version(&self) -> Result<HpaVersion, GatewayError> {
        Ok(self.version)
    }
}

#[derive(Default)]
struct NodePoolState {
    pools: Vec<NodePoolDefinition>,
    set_calls: Vec<(String, NodePoolAutoscaling)>,
    failing_pools: HashMap<String, String>,
    /// Operation name to (pool, polls left).
    pending_polls: HashMap<String, (String, u32)>,
    polls: u32,
}

/// Node-pool API over fixed definitions. Operations finish after a
/// configurable number of polls.
pub struct MockNodePoolApi {
    polls_until_done: u32,
    state: Mutex<NodePoolState>,
}

impl MockNodePoolApi {
    pub fn new(pools: Vec<NodePoolDefinition>) -> Self {
        Self {
            polls_until_done: 1,
            state: Mutex::new(NodePoolState {
                pools,
                ..Default::default()
            }),
        }
    }

    pub fn with_polls_until_done(mut self, polls: u32) -> Self {
        self.polls_until_done = polls;
        self
    }

    /// Operations on `pool` finish with `message` as their error.
    pub fn with_failing_pool(self, pool: &str, message: &str) -> Self {
        lock(&self.state)
            .failing_pools
            .insert(pool.to_string(), message.to_string());
        self
    }

    /// `(pool, autoscaling)` for every set-autoscaling call, in order.
    pub fn set_calls(&self) -> Vec<(String, NodePoolAutoscaling)> {
        lock(&self.state).set_calls.clone()
    }

    pub fn operation_polls(&self) -> u32 {
        lock(&self.state).polls
    }

    /// Current pool definitions, including autoscaling set so far.
    pub fn list_definitions(&self) -> Vec<NodePoolDefinition> {
        lock(&self.state).pools.clone()
    }
}

#[async_trait]
impl NodePoolApi for MockNodePoolApi {
    async fn list_node_pools(
        &self,
        _location: &ClusterLocation,
    ) -> Result<Vec<NodePoolDefinition>, GatewayError> {
        Ok(lock(&self.state).pools.clone())
    }

    async fn set_autoscaling(
        &self,
        _location: &ClusterLocation,
        node_pool: &str,
        autoscaling: &NodePoolAutoscaling,
    ) -> Result<Operation, GatewayError> {
        let mut state = lock(&self.state);
        state
            .set_calls
            .push((node_pool.to_string(), autoscaling.clone()));
        if let Some(pool) = state.pools.iter_mut().find(|p| p.name == node_pool) {
            pool.autoscaling = Some(autoscaling.clone());
        }

        let name = format!("operation-{}-{}", node_pool, state.set_calls.len());
        state
            .pending_polls
            .insert(name.clone(), (node_pool.to_string(), self.polls_until_done));
        Ok(Operation {
            name,
            status: if self.polls_until_done == 0 { "DONE" } else { "RUNNING" }.to_string(),
            ..Default::default()
        })
    }

    async fn get_operation(
        &self,
        _location: &ClusterLocation,
        operation: &str,
    ) -> Result<Operation, GatewayError> {
        let mut state = lock(&self.state);
        state.polls += 1;
        let (pool, remaining) = state
            .pending_polls
            .get_mut(operation)
            .ok_or_else(|| GatewayError::Api {
                operation: "get operation",
                status: 404,
                body: format!("operation {operation} not found"),
            })?;
        *remaining = remaining.saturating_sub(1);
        if *remaining > 0 {
            return Ok(Operation {
                name: operation.to_string(),
                status: "RUNNING".to_string(),
                ..Default::default()
            });
        }

        let pool = pool.clone();
        let error = state.failing_pools.get(&pool).map(|message| OperationError {
            code: 9,
            message: message.clone(),
        });
        Ok(Operation {
            name: operation.to_string(),
            status: "DONE".to_string(),
            error,
            ..Default::default()
        })
    }
}

/// Factory handing out one prebuilt gateway.
pub struct MockClientFactory {
    gateway: Gateway,
    fail_with: Option<String>,
    connects: Mutex<usize>,
}

impl MockClientFactory {
    pub fn new(cluster: Arc<MockClusterApi>, node_pools: Arc<MockNodePoolApi>) -> Self {
        let location = ClusterLocation {
            project: "proj".to_string(),
            cluster: "main".to_string(),
            location: "asia-southeast1".to_string(),
        };
        Self {
            gateway: Gateway::new(cluster, node_pools, location),
            fail_with: None,
            connects: Mutex::new(0),
        }
    }

    /// Every connect fails with a credential error carrying `message`.
    pub fn failing(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }

    pub fn connects(&self) -> usize {
        *lock(&self.connects)
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(&self, _cluster: &ClusterRecord) -> Result<Gateway, GatewayError> {
        *lock(&self.connects) += 1;
        match &self.fail_with {
            Some(message) => Err(GatewayError::Credentials(message.clone())),
            None => Ok(self.gateway.clone()),
        }
    }
}

// Object builders for tests.

fn meta(namespace: Option<&str>, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: if labels.is_empty() { None } else { Some(labels) },
        ..Default::default()
    }
}

fn pod_spec(cpu: &str, memory: &str, node_selector: BTreeMap<String, String>) -> PodSpec {
    let requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(cpu.to_string())),
        ("memory".to_string(), Quantity(memory.to_string())),
    ]);
    PodSpec {
        containers: vec![Container {
            name: "main".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }],
        node_selector: if node_selector.is_empty() {
            None
        } else {
            Some(node_selector)
        },
        ..Default::default()
    }
}

/// A node in `pool` with the given allocatable CPU and memory.
pub fn node(name: &str, pool: &str, cpu: &str, memory: &str) -> Node {
    Node {
        metadata: meta(
            None,
            name,
            BTreeMap::from([(NODE_POOL_LABEL.to_string(), pool.to_string())]),
        ),
        status: Some(NodeStatus {
            allocatable: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
                ("pods".to_string(), Quantity("110".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// A deployment whose pods request `cpu`/`memory`, optionally pinned to a pool.
pub fn deployment(
    namespace: &str,
    name: &str,
    replicas: Option<i32>,
    cpu: &str,
    memory: &str,
    pool: Option<&str>,
) -> Deployment {
    let selector = pool
        .map(|p| BTreeMap::from([(NODE_POOL_LABEL.to_string(), p.to_string())]))
        .unwrap_or_default();
    let replicas_now = replicas.unwrap_or(1);
    Deployment {
        metadata: meta(Some(namespace), name, BTreeMap::new()),
        spec: Some(DeploymentSpec {
            replicas,
            template: PodTemplateSpec {
                spec: Some(pod_spec(cpu, memory, selector)),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(replicas_now),
            available_replicas: Some(replicas_now),
            ready_replicas: Some(replicas_now),
            unavailable_replicas: None,
            ..Default::default()
        }),
    }
}

/// A daemon set whose pods request `cpu`/`memory` on every node.
pub fn daemon_set(namespace: &str, name: &str, cpu: &str, memory: &str) -> DaemonSet {
    DaemonSet {
        metadata: meta(Some(namespace), name, BTreeMap::new()),
        spec: Some(DaemonSetSpec {
            template: PodTemplateSpec {
                spec: Some(pod_spec(cpu, memory, BTreeMap::new())),
                ..Default::default()
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// An HPA scaling the deployment of the same name.
pub fn hpa(namespace: &str, name: &str, min: i32, max: i32) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        version: HpaVersion::V2,
        name: name.to_string(),
        namespace: namespace.to_string(),
        min_replicas: min,
        max_replicas: max,
        current_replicas: min,
        desired_replicas: min,
        scale_target_ref: ScaleTargetRef {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            name: name.to_string(),
        },
    }
}

/// An autoscaled pool definition.
pub fn node_pool(name: &str, max_pods_per_node: i64, max_nodes: i32) -> NodePoolDefinition {
    NodePoolDefinition {
        name: name.to_string(),
        max_pods_per_node,
        autoscaling: Some(NodePoolAutoscaling {
            enabled: true,
            min_node_count: 1,
            max_node_count: max_nodes,
            ..Default::default()
        }),
    }
}
