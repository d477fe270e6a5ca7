//! GKE container API (v1) client for node-pool definitions and autoscaling.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error};

use super::credentials::CredentialCache;
use super::{GatewayError, NodePoolApi};
use crate::model::DatacenterRecord;

/// Pods per node GKE assigns when neither the pool nor the cluster sets one.
pub const DEFAULT_MAX_PODS_PER_NODE: i64 = 110;

/// Where a GKE cluster lives, parsed from `gke_{project}_{cluster}_{location}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterLocation {
    pub project: String,
    pub cluster: String,
    pub location: String,
}

impl ClusterLocation {
    pub fn parse(qualified_name: &str) -> Result<Self, GatewayError> {
        let parts: Vec<&str> = qualified_name.split('_').collect();
        match parts.as_slice() {
            ["gke", project, cluster, location]
                if !project.is_empty() && !cluster.is_empty() && !location.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    cluster: cluster.to_string(),
                    location: location.to_string(),
                })
            }
            _ => Err(GatewayError::InvalidClusterName(qualified_name.to_string())),
        }
    }

    fn cluster_path(&self) -> String {
        format!(
            "projects/{}/locations/{}/clusters/{}",
            self.project, self.location, self.cluster
        )
    }

    fn operation_path(&self, operation: &str) -> String {
        format!(
            "projects/{}/locations/{}/operations/{}",
            self.project, self.location, operation
        )
    }
}

/// Autoscaling settings of a node pool.
///
/// Pools using the `ANY`/total location policy carry their bound in the
/// `total_*` fields instead of the per-zone ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoscaling {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub min_node_count: i32,
    #[serde(default)]
    pub max_node_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_min_node_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_max_node_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoprovisioned: Option<bool>,
}

impl NodePoolAutoscaling {
    /// The bound that limits this pool.
    pub fn max_nodes(&self) -> i32 {
        match self.total_max_node_count {
            Some(total) if total > 0 => total,
            _ => self.max_node_count,
        }
    }

    /// Copy with the limiting bound replaced.
    pub fn with_max_nodes(&self, max: i32) -> Self {
        let mut next = self.clone();
        match self.total_max_node_count {
            Some(total) if total > 0 => next.total_max_node_count = Some(max),
            _ => next.max_node_count = max,
        }
        next
    }
}

/// Static definition of one node pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolDefinition {
    pub name: String,
    pub max_pods_per_node: i64,
    /// `None` when autoscaling is not configured on the pool.
    pub autoscaling: Option<NodePoolAutoscaling>,
}

impl NodePoolDefinition {
    /// Configured max-node bound, enabled or not. 0 when the pool has no
    /// autoscaling settings at all.
    pub fn max_nodes(&self) -> i32 {
        self.autoscaling
            .as_ref()
            .map_or(0, NodePoolAutoscaling::max_nodes)
    }
}

/// Long-running GKE operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

impl Operation {
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    /// Failure text of a finished operation, if it failed.
    pub fn failure(&self) -> Option<String> {
        match &self.error {
            Some(err) if err.code != 0 || !err.message.is_empty() => Some(if err.message.is_empty() {
                format!("operation {} failed with code {}", self.name, err.code)
            } else {
                err.message.clone()
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterWire {
    #[serde(default)]
    node_pools: Vec<NodePoolWire>,
    #[serde(default)]
    default_max_pods_constraint: Option<MaxPodsConstraint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodePoolWire {
    name: String,
    #[serde(default)]
    autoscaling: Option<NodePoolAutoscaling>,
    #[serde(default)]
    max_pods_constraint: Option<MaxPodsConstraint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxPodsConstraint {
    // int64 fields arrive as JSON strings.
    #[serde(deserialize_with = "int64_field")]
    max_pods_per_node: i64,
}

fn int64_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

impl ClusterWire {
    fn into_definitions(self) -> Vec<NodePoolDefinition> {
        let cluster_default = self
            .default_max_pods_constraint
            .map(|c| c.max_pods_per_node)
            .unwrap_or(DEFAULT_MAX_PODS_PER_NODE);

        self.node_pools
            .into_iter()
            .map(|pool| NodePoolDefinition {
                name: pool.name,
                max_pods_per_node: pool
                    .max_pods_constraint
                    .map(|c| c.max_pods_per_node)
                    .unwrap_or(cluster_default),
                autoscaling: pool.autoscaling,
            })
            .collect()
    }
}

#[derive(Serialize)]
struct SetAutoscalingRequest<'a> {
    autoscaling: &'a NodePoolAutoscaling,
}

/// Node-pool API over GKE REST, authenticated with the datacenter's token.
pub struct GkeNodePoolApi {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<CredentialCache>,
    datacenter: DatacenterRecord,
}

impl GkeNodePoolApi {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        credentials: Arc<CredentialCache>,
        datacenter: DatacenterRecord,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            credentials,
            datacenter,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    async fn send(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        let token = self.credentials.token(&self.datacenter).await?;
        let response = request.bearer_auth(token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, operation, "GKE request failed");
            if status == reqwest::StatusCode::UNAUTHORIZED {
                self.credentials.invalidate(&self.datacenter.name).await;
            }
            return Err(GatewayError::Api {
                operation,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl NodePoolApi for GkeNodePoolApi {
    async fn list_node_pools(
        &self,
        location: &ClusterLocation,
    ) -> Result<Vec<NodePoolDefinition>, GatewayError> {
        let url = self.url(&location.cluster_path());
        debug!(url = %url, "Fetching cluster node pools");

        let response = self.send("get cluster", self.http.get(&url)).await?;
        let cluster: ClusterWire = response.json().await?;
        Ok(cluster.into_definitions())
    }

    async fn set_autoscaling(
        &self,
        location: &ClusterLocation,
        node_pool: &str,
        autoscaling: &NodePoolAutoscaling,
    ) -> Result<Operation, GatewayError> {
        let url = self.url(&format!(
            "{}/nodePools/{}:setAutoscaling",
            location.cluster_path(),
            node_pool
        ));
        debug!(url = %url, max_nodes = autoscaling.max_nodes(), "Setting node pool autoscaling");

        let request = self.http.post(&url).json(&SetAutoscalingRequest { autoscaling });
        let response = self.send("set autoscaling", request).await?;
        Ok(response.json().await?)
    }

    async fn get_operation(
        &self,
        location: &ClusterLocation,
        operation: &str,
    ) -> Result<Operation, GatewayError> {
        // Operation names may come back fully qualified.
        let short = operation.rsplit('/').next().unwrap_or(operation);
        let url = self.url(&location.operation_path(short));

        let response = self.send("get operation", self.http.get(&url)).await?;
        Ok(response.json().await?)
    }
}
