//! Node-pool sizing pass of one execution.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use futures_util::future::try_join_all;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Node;
use prescale_capacity::quantity::quantity_value;
use prescale_capacity::{
    plan_node_pool, MatchError, NodePoolRequestedResourceData, NodePoolResourceData,
    NodePoolShape, Workload, DEFAULT_REPLICAS,
};
use tracing::{debug, info, warn};

use super::ExecError;
use crate::gateway::{Gateway, GatewayError, HorizontalPodAutoscaler, NodePoolDefinition};
use crate::model::ScheduledHpaTarget;

/// Requested resources per pool, shared by every contributor of one
/// execution.
struct DemandLedger<'a> {
    pools: &'a [NodePoolResourceData],
    requested: Mutex<HashMap<String, NodePoolRequestedResourceData>>,
}

impl<'a> DemandLedger<'a> {
    fn new(pools: &'a [NodePoolResourceData]) -> Self {
        let requested = pools
            .iter()
            .map(|p| (p.name.clone(), NodePoolRequestedResourceData::default()))
            .collect();
        Self {
            pools,
            requested: Mutex::new(requested),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NodePoolRequestedResourceData>> {
        self.requested.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `replicas` copies of `workload` to every pool it can land on.
    fn contribute(&self, workload: &Workload, replicas: i32) -> Result<(), MatchError> {
        let mut matched = Vec::new();
        for pool in self.pools {
            if workload.matches(&pool.labels)? {
                matched.push(pool.name.as_str());
            }
        }
        debug!(workload = %workload.name, replicas, pools = ?matched, "Workload demand");

        let mut requested = self.lock();
        for name in matched {
            requested.entry(name.to_string()).or_default().add(workload, replicas);
        }
        Ok(())
    }

    fn into_requested(self) -> HashMap<String, NodePoolRequestedResourceData> {
        self.requested
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn daemon_set_workload(daemon_set: &DaemonSet) -> Result<Workload, ExecError> {
    let name = qualified_name(&daemon_set.metadata);
    let spec = daemon_set.spec.as_ref().and_then(|s| s.template.spec.as_ref());
    Ok(Workload::from_pod_spec(name, spec)?)
}

fn deployment_workload(deployment: &Deployment) -> Result<Workload, ExecError> {
    let name = qualified_name(&deployment.metadata);
    let spec = deployment.spec.as_ref().and_then(|s| s.template.spec.as_ref());
    Ok(Workload::from_pod_spec(name, spec)?)
}

fn qualified_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

/// Shape of a pool from its definition and one of its nodes.
fn pool_shape(definition: &NodePoolDefinition, nodes: &[Node]) -> Result<NodePoolShape, ExecError> {
    let node = nodes
        .first()
        .ok_or_else(|| GatewayError::NoExistingNode(definition.name.clone()))?;
    let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());

    Ok(NodePoolShape {
        name: definition.name.clone(),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        max_pods_per_node: definition.max_pods_per_node,
        current_max_nodes: definition.max_nodes(),
        current_node_count: i32::try_from(nodes.len()).unwrap_or(i32::MAX),
        allocatable_cpu: quantity_value(allocatable.and_then(|a| a.get("cpu")))?,
        allocatable_memory: quantity_value(allocatable.and_then(|a| a.get("memory")))?,
    })
}

/// Sizes every pool for the event and applies the bounds that moved.
/// Returns the bound in effect per pool, in definition order.
pub(super) async fn size_node_pools(
    gateway: &Gateway,
    definitions: &[NodePoolDefinition],
    selected: &[ScheduledHpaTarget],
    live: &BTreeMap<String, HorizontalPodAutoscaler>,
) -> Result<Vec<(String, i32)>, ExecError> {
    let daemon_sets = gateway
        .cluster
        .list_daemon_sets(None)
        .await?
        .iter()
        .map(daemon_set_workload)
        .collect::<Result<Vec<_>, _>>()?;

    let resources = try_join_all(definitions.iter().map(|definition| {
        let daemon_sets = &daemon_sets;
        async move {
            let nodes = gateway.list_pool_nodes(&definition.name).await?;
            let shape = pool_shape(definition, &nodes)?;
            let resource = NodePoolResourceData::compute(&shape, daemon_sets)?;
            debug!(
                pool = %resource.name,
                nodes = resource.current_node_count,
                max_nodes = resource.current_max_nodes,
                daemon_sets = resource.matched_daemon_sets.len(),
                "Computed pool resources"
            );
            Ok::<_, ExecError>(resource)
        }
    }))
    .await?;

    let ledger = DemandLedger::new(&resources);
    collect_demand(gateway, &ledger, selected, live).await?;
    let requested = ledger.into_requested();

    let bounds = try_join_all(definitions.iter().zip(&resources).map(|(definition, resource)| {
        let requested = requested.get(&resource.name).copied().unwrap_or_default();
        async move {
            let Some(autoscaling) = definition.autoscaling.as_ref().filter(|a| a.enabled) else {
                debug!(pool = %definition.name, "Pool has no autoscaling; not sizing");
                return Ok::<_, ExecError>((definition.name.clone(), definition.max_nodes()));
            };

            let plan = plan_node_pool(resource, &requested);
            if !plan.changed() {
                info!(pool = %definition.name, max_nodes = plan.current_max_nodes, "Pool has headroom");
                return Ok((definition.name.clone(), plan.current_max_nodes));
            }

            info!(
                pool = %definition.name,
                nodes_needed = plan.nodes_needed,
                from = plan.current_max_nodes,
                to = plan.new_max_nodes,
                "Growing pool bound"
            );
            gateway
                .resize_node_pool(&definition.name, &autoscaling.with_max_nodes(plan.new_max_nodes))
                .await?;
            Ok((definition.name.clone(), plan.new_max_nodes))
        }
    }))
    .await?;

    Ok(bounds)
}

/// Feeds the ledger: selected targets at their requested max, other HPAs at
/// their current max, and deployments no HPA scales at their replica count.
/// Targets resolve against one deployment listing.
async fn collect_demand(
    gateway: &Gateway,
    ledger: &DemandLedger<'_>,
    selected: &[ScheduledHpaTarget],
    live: &BTreeMap<String, HorizontalPodAutoscaler>,
) -> Result<(), ExecError> {
    let requested_max: HashMap<String, i32> = selected
        .iter()
        .map(|t| (t.key(), t.max_replicas))
        .collect();

    let deployments: HashMap<String, Deployment> = gateway
        .cluster
        .list_deployments(None)
        .await?
        .into_iter()
        .map(|d| (qualified_name(&d.metadata), d))
        .collect();

    // Deployments some HPA owns, as namespace/name.
    let mut covered = HashSet::new();
    for hpa in live.values() {
        let name = match hpa.scale_target_ref.deployment_name() {
            Ok(name) => format!("{}/{}", hpa.namespace, name),
            Err(e) => {
                warn!(hpa = %hpa.key(), error = %e, "Skipping HPA demand");
                continue;
            }
        };
        let Some(deployment) = deployments.get(&name) else {
            warn!(hpa = %hpa.key(), deployment = %name, "Skipping HPA demand; deployment not found");
            continue;
        };

        let replicas = requested_max
            .get(&hpa.key())
            .copied()
            .unwrap_or(hpa.max_replicas);
        debug!(
            hpa = %hpa.key(),
            current = hpa.current_replicas,
            desired = hpa.desired_replicas,
            planned = replicas,
            "HPA demand"
        );
        ledger.contribute(&deployment_workload(deployment)?, replicas)?;
        covered.insert(name);
    }

    for (name, deployment) in &deployments {
        if covered.contains(name) {
            continue;
        }
        let replicas = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(DEFAULT_REPLICAS);
        ledger.contribute(&deployment_workload(deployment)?, replicas)?;
    }

    Ok(())
}
