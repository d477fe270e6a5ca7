//! Cluster gateway.
//!
//! Everything the engine and watcher need from the outside world goes
//! through a [`Gateway`]: the Kubernetes API of the target cluster
//! ([`ClusterApi`]) and the GKE node-pool API ([`NodePoolApi`]). A
//! [`ClientFactory`] builds a gateway for a registered cluster.

pub mod credentials;
pub mod gke;
pub mod hpa;
pub mod kubernetes;
pub mod mock;
pub mod operation;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Node;
use thiserror::Error;
use tracing::{debug, info};

pub use credentials::CredentialCache;
pub use gke::{ClusterLocation, GkeNodePoolApi, NodePoolAutoscaling, NodePoolDefinition, Operation};
pub use hpa::{HorizontalPodAutoscaler, HpaVersion, ScaleTargetRef};
pub use kubernetes::KubeClusterApi;
pub use operation::{wait_for_operation, BackoffPolicy, PollPolicy};

use crate::model::ClusterRecord;

/// Label GKE puts on every node naming its pool.
pub const NODE_POOL_LABEL: &str = "cloud.google.com/gke-nodepool";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("hpa version unknown")]
    UnknownHpaVersion(String),

    #[error("target ref resolve error")]
    TargetRefUnresolvable {
        api_version: String,
        kind: String,
        name: String,
    },

    #[error("deployment not found")]
    DeploymentNotFound { namespace: String, name: String },

    #[error("hpa {namespace}/{name} not found")]
    HpaNotFound { namespace: String, name: String },

    #[error("no existing node found for node pool {0}")]
    NoExistingNode(String),

    #[error("{operation} failed with status {status}: {body}")]
    Api {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("operation {name} failed: {message}")]
    Operation { name: String, message: String },

    #[error("operation {name} did not finish within {after:?}")]
    OperationTimeout { name: String, after: Duration },

    #[error("invalid cluster name: {0}")]
    InvalidClusterName(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),
}

/// New bounds for one HPA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpaOverride {
    pub namespace: String,
    pub name: String,
    /// `None` means the minimum of one replica.
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
}

/// Kubernetes API of one cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_namespaces(&self) -> Result<Vec<String>, GatewayError>;

    /// HPAs across all namespaces, read at `version`.
    async fn list_hpas(&self, version: HpaVersion) -> Result<Vec<HorizontalPodAutoscaler>, GatewayError>;

    /// Writes new bounds onto an existing HPA and returns the stored object.
    async fn update_hpa(
        &self,
        version: HpaVersion,
        hpa_override: &HpaOverride,
    ) -> Result<HorizontalPodAutoscaler, GatewayError>;

    async fn list_deployments(&self, namespace: Option<&str>) -> Result<Vec<Deployment>, GatewayError>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, GatewayError>;

    async fn list_daemon_sets(&self, namespace: Option<&str>) -> Result<Vec<DaemonSet>, GatewayError>;

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>, GatewayError>;

    /// Newest autoscaling API version the server offers that we can read.
    async fn latest_hpa_version(&self) -> Result<HpaVersion, GatewayError>;
}

/// Cloud node-pool API.
#[async_trait]
pub trait NodePoolApi: Send + Sync {
    async fn list_node_pools(&self, location: &ClusterLocation) -> Result<Vec<NodePoolDefinition>, GatewayError>;

    /// Starts an autoscaling update; the returned operation may still be running.
    async fn set_autoscaling(
        &self,
        location: &ClusterLocation,
        node_pool: &str,
        autoscaling: &NodePoolAutoscaling,
    ) -> Result<Operation, GatewayError>;

    async fn get_operation(&self, location: &ClusterLocation, operation: &str) -> Result<Operation, GatewayError>;
}

/// Builds a gateway for a registered cluster.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, cluster: &ClusterRecord) -> Result<Gateway, GatewayError>;
}

/// Both APIs of one cluster plus where it lives.
#[derive(Clone)]
pub struct Gateway {
    pub cluster: Arc<dyn ClusterApi>,
    pub node_pools: Arc<dyn NodePoolApi>,
    pub location: ClusterLocation,
    poll: PollPolicy,
}

impl Gateway {
    pub fn new(cluster: Arc<dyn ClusterApi>, node_pools: Arc<dyn NodePoolApi>, location: ClusterLocation) -> Self {
        Self {
            cluster,
            node_pools,
            location,
            poll: PollPolicy::default(),
        }
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub async fn list_node_pools(&self) -> Result<Vec<NodePoolDefinition>, GatewayError> {
        self.node_pools.list_node_pools(&self.location).await
    }

    /// Nodes carrying the pool label. A pool without nodes is an error since
    /// its node shape cannot be known.
    pub async fn list_pool_nodes(&self, pool: &str) -> Result<Vec<Node>, GatewayError> {
        let selector = format!("{NODE_POOL_LABEL}={pool}");
        let nodes = self.cluster.list_nodes(Some(&selector)).await?;
        if nodes.is_empty() {
            return Err(GatewayError::NoExistingNode(pool.to_string()));
        }
        debug!(pool, nodes = nodes.len(), "Listed pool nodes");
        Ok(nodes)
    }

    /// Applies new autoscaling settings and waits for the operation to finish.
    pub async fn resize_node_pool(&self, pool: &str, autoscaling: &NodePoolAutoscaling) -> Result<(), GatewayError> {
        let operation = self
            .node_pools
            .set_autoscaling(&self.location, pool, autoscaling)
            .await?;
        info!(pool, operation = %operation.name, max_nodes = autoscaling.max_nodes(), "Node pool resize started");
        wait_for_operation(self.node_pools.as_ref(), &self.location, operation, &self.poll).await?;
        info!(pool, max_nodes = autoscaling.max_nodes(), "Node pool resized");
        Ok(())
    }

    /// The HPA version to talk to: the one stored for the cluster, else the
    /// newest one the API server offers.
    pub async fn hpa_version(&self, stored: Option<&str>) -> Result<HpaVersion, GatewayError> {
        match stored.filter(|v| !v.trim().is_empty()) {
            Some(stored) => HpaVersion::parse(stored),
            None => self.cluster.latest_hpa_version().await,
        }
    }
}

/// Settings for talking to GKE and cluster API servers.
#[derive(Debug, Clone)]
pub struct GkeConfig {
    pub api_base: String,
    pub metadata_token_url: String,
    /// Field manager recorded on HPA writes.
    pub field_manager: String,
    pub poll: PollPolicy,
}

impl Default for GkeConfig {
    fn default() -> Self {
        Self {
            api_base: "https://container.googleapis.com".to_string(),
            metadata_token_url: "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts"
                .to_string(),
            field_manager: "prescaler".to_string(),
            poll: PollPolicy::default(),
        }
    }
}

/// Builds gateways backed by GKE and the cluster's API server.
pub struct GkeClientFactory {
    http: reqwest::Client,
    credentials: Arc<CredentialCache>,
    config: GkeConfig,
}

impl GkeClientFactory {
    pub fn new(http: reqwest::Client, credentials: Arc<CredentialCache>, config: GkeConfig) -> Self {
        Self {
            http,
            credentials,
            config,
        }
    }
}

#[async_trait]
impl ClientFactory for GkeClientFactory {
    async fn connect(&self, cluster: &ClusterRecord) -> Result<Gateway, GatewayError> {
        let location = ClusterLocation::parse(&cluster.name)?;
        let token = self.credentials.token(&cluster.datacenter).await?;
        let kube = KubeClusterApi::connect(cluster, &token, &self.config.field_manager).await?;
        let node_pools = GkeNodePoolApi::new(
            self.http.clone(),
            self.config.api_base.clone(),
            self.credentials.clone(),
            cluster.datacenter.clone(),
        );
        Ok(Gateway::new(Arc::new(kube), Arc::new(node_pools), location).with_poll_policy(self.config.poll.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::mock::{self, MockClusterApi, MockNodePoolApi};
    use super::*;

    fn gateway(cluster: MockClusterApi, pools: MockNodePoolApi) -> Gateway {
        Gateway::new(
            Arc::new(cluster),
            Arc::new(pools),
            ClusterLocation::parse("gke_proj_main_asia-southeast1").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_list_pool_nodes_filters_by_label() {
        let gw = gateway(
            MockClusterApi::new()
                .with_node(mock::node("n1", "default", "4", "16Gi"))
                .with_node(mock::node("n2", "highmem", "4", "64Gi")),
            MockNodePoolApi::new(vec![]),
        );
        let nodes = gw.list_pool_nodes("highmem").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].metadata.name.as_deref(), Some("n2"));
    }

    #[tokio::test]
    async fn test_empty_pool_is_error() {
        let gw = gateway(MockClusterApi::new(), MockNodePoolApi::new(vec![]));
        let err = gw.list_pool_nodes("default").await.unwrap_err();
        assert_eq!(err.to_string(), "no existing node found for node pool default");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resize_waits_for_operation() {
        let pools = Arc::new(MockNodePoolApi::new(vec![mock::node_pool("default", 110, 3)]).with_polls_until_done(2));
        let gw = Gateway::new(
            Arc::new(MockClusterApi::new()),
            pools.clone(),
            ClusterLocation::parse("gke_proj_main_asia-southeast1").unwrap(),
        );
        let autoscaling = NodePoolAutoscaling {
            enabled: true,
            min_node_count: 1,
            max_node_count: 9,
            ..Default::default()
        };

        gw.resize_node_pool("default", &autoscaling).await.unwrap();
        assert_eq!(pools.set_calls(), vec![("default".to_string(), autoscaling)]);
        assert_eq!(pools.operation_polls(), 2);
    }

    #[tokio::test]
    async fn test_hpa_version_prefers_stored() {
        let gw = gateway(MockClusterApi::new(), MockNodePoolApi::new(vec![]));

        assert_eq!(gw.hpa_version(Some("autoscaling/v1")).await.unwrap(), HpaVersion::V1);
        assert_eq!(gw.hpa_version(None).await.unwrap(), HpaVersion::V2);
        assert_eq!(gw.hpa_version(Some("")).await.unwrap(), HpaVersion::V2);
        assert_eq!(
            gw.hpa_version(Some("autoscaling/v3")).await.unwrap_err().to_string(),
            "hpa version unknown"
        );
    }
}
