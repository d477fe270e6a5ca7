//! Cluster API over a `kube` client.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::future::try_join_all;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Namespace, Node};
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::DynamicObject;
use kube::Client;
use serde_json::json;
use tracing::{debug, info};

use super::hpa::{self, HorizontalPodAutoscaler, HpaVersion};
use super::{ClusterApi, GatewayError, HpaOverride};
use crate::model::ClusterRecord;

/// Cluster API bound to one cluster's API server.
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    field_manager: String,
}

impl KubeClusterApi {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Builds a client for `cluster` authenticated with a bearer token.
    pub async fn connect(
        cluster: &ClusterRecord,
        token: &str,
        field_manager: &str,
    ) -> Result<Self, GatewayError> {
        let kubeconfig = kubeconfig_for(cluster, token)?;
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
        let client = Client::try_from(config)?;
        debug!(cluster = %cluster.name, "Built cluster client");
        Ok(Self::new(client, field_manager))
    }

    fn hpa_api(&self, version: HpaVersion, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &version.api_resource())
    }

    async fn list_hpas_in(
        &self,
        version: HpaVersion,
        namespace: &str,
    ) -> Result<Vec<HorizontalPodAutoscaler>, GatewayError> {
        let list = self
            .hpa_api(version, namespace)
            .list(&ListParams::default())
            .await?;
        list.items
            .iter()
            .map(|obj| HorizontalPodAutoscaler::from_dynamic(version, obj))
            .collect()
    }
}

fn kubeconfig_for(cluster: &ClusterRecord, token: &str) -> Result<Kubeconfig, GatewayError> {
    let server = if cluster.server_endpoint.starts_with("https://") {
        cluster.server_endpoint.clone()
    } else {
        format!("https://{}", cluster.server_endpoint)
    };

    let mut cluster_entry = json!({ "server": server });
    if let Some(ca) = certificate_authority_data(&cluster.certificate) {
        cluster_entry["certificate-authority-data"] = json!(ca);
    }

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": cluster.name, "cluster": cluster_entry }],
        "users": [{ "name": "prescaler", "user": { "token": token } }],
        "contexts": [{
            "name": cluster.name,
            "context": { "cluster": cluster.name, "user": "prescaler" }
        }],
        "current-context": cluster.name,
    }))
    .map_err(|source| GatewayError::Decode {
        kind: "kubeconfig",
        source,
    })
}

/// Kubeconfig wants base64; registered clusters may carry raw PEM.
fn certificate_authority_data(certificate: &str) -> Option<String> {
    let trimmed = certificate.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.starts_with("-----BEGIN") {
        Some(STANDARD.encode(trimmed))
    } else {
        Some(trimmed.to_string())
    }
}

fn list_params(label_selector: Option<&str>) -> ListParams {
    match label_selector {
        Some(selector) => ListParams::default().labels(selector),
        None => ListParams::default(),
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_namespaces(&self) -> Result<Vec<String>, GatewayError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    async fn list_hpas(&self, version: HpaVersion) -> Result<Vec<HorizontalPodAutoscaler>, GatewayError> {
        let namespaces = self.list_namespaces().await?;
        let per_namespace =
            try_join_all(namespaces.iter().map(|ns| self.list_hpas_in(version, ns))).await?;
        Ok(per_namespace.into_iter().flatten().collect())
    }

    async fn update_hpa(
        &self,
        version: HpaVersion,
        hpa_override: &HpaOverride,
    ) -> Result<HorizontalPodAutoscaler, GatewayError> {
        let api = self.hpa_api(version, &hpa_override.namespace);
        let mut obj = api
            .get_opt(&hpa_override.name)
            .await?
            .ok_or_else(|| GatewayError::HpaNotFound {
                namespace: hpa_override.namespace.clone(),
                name: hpa_override.name.clone(),
            })?;

        hpa::apply_override(&mut obj.data, hpa_override.min_replicas, hpa_override.max_replicas);
        obj.metadata.resource_version = None;
        obj.metadata.managed_fields = None;

        let params = PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        };
        let updated = api.replace(&hpa_override.name, &params, &obj).await?;
        info!(
            namespace = %hpa_override.namespace,
            name = %hpa_override.name,
            min_replicas = ?hpa_override.min_replicas,
            max_replicas = hpa_override.max_replicas,
            "Updated HPA"
        );
        HorizontalPodAutoscaler::from_dynamic(version, &updated)
    }

    async fn list_deployments(&self, namespace: Option<&str>) -> Result<Vec<Deployment>, GatewayError> {
        let api: Api<Deployment> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, GatewayError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| GatewayError::DeploymentNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_daemon_sets(&self, namespace: Option<&str>) -> Result<Vec<DaemonSet>, GatewayError> {
        let api: Api<DaemonSet> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>, GatewayError> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.list(&list_params(label_selector)).await?.items)
    }

    async fn latest_hpa_version(&self) -> Result<HpaVersion, GatewayError> {
        let groups = self.client.list_api_groups().await?;
        let autoscaling = groups
            .groups
            .iter()
            .find(|g| g.name == HpaVersion::GROUP)
            .ok_or_else(|| GatewayError::UnknownHpaVersion("autoscaling group not served".to_string()))?;
        HpaVersion::latest_of(autoscaling.versions.iter().map(|v| v.version.as_str()))
    }
}
