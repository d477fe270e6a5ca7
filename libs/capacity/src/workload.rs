//! Per-replica resource demand of a pod template.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeAffinity, PodSpec};

use crate::error::{MatchError, QuantityError};
use crate::matcher;
use crate::quantity::quantity_value;

/// Replica count assumed for a deployment that does not set one.
pub const DEFAULT_REPLICAS: i32 = 1;

/// Scheduling constraints and per-replica requests of one workload
/// (a deployment's or daemon set's pod template).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workload {
    /// `namespace/name`, for logs.
    pub name: String,
    pub node_selector: BTreeMap<String, String>,
    pub node_affinity: Option<NodeAffinity>,
    /// Cores requested by one replica, summed over its containers.
    pub cpu: f64,
    /// Bytes requested by one replica, summed over its containers.
    pub memory: f64,
}

impl Workload {
    /// Builds a workload from a pod spec. A missing spec yields a workload
    /// with no requests and no constraints.
    pub fn from_pod_spec(name: impl Into<String>, spec: Option<&PodSpec>) -> Result<Self, QuantityError> {
        let mut workload = Workload {
            name: name.into(),
            ..Default::default()
        };
        let Some(spec) = spec else {
            return Ok(workload);
        };

        for container in &spec.containers {
            let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) else {
                continue;
            };
            workload.cpu += quantity_value(requests.get("cpu"))?;
            workload.memory += quantity_value(requests.get("memory"))?;
        }

        workload.node_selector = spec.node_selector.clone().unwrap_or_default();
        workload.node_affinity = spec
            .affinity
            .as_ref()
            .and_then(|a| a.node_affinity.clone());
        Ok(workload)
    }

    /// Whether this workload can land on a node with `labels`.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> Result<bool, MatchError> {
        matcher::matches(labels, self.node_affinity.as_ref(), Some(&self.node_selector))
    }
}
