//! Available vs requested capacity per node pool, and the sizing decision.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::warn;

use crate::error::MatchError;
use crate::workload::Workload;

/// Nodes added on top of the computed deficit whenever a pool is resized.
pub const SAFETY_MARGIN: i32 = 5;

/// Static shape of a node pool as seen through one representative node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePoolShape {
    pub name: String,
    /// Labels of the representative node.
    pub labels: BTreeMap<String, String>,
    pub max_pods_per_node: i64,
    pub current_max_nodes: i32,
    pub current_node_count: i32,
    /// Allocatable cores on the representative node.
    pub allocatable_cpu: f64,
    /// Allocatable bytes on the representative node.
    pub allocatable_memory: f64,
}

/// What one node, and the pool at its current bound, can still host after
/// daemon-set overhead.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodePoolResourceData {
    pub name: String,
    #[serde(skip)]
    pub labels: BTreeMap<String, String>,
    pub current_node_count: i32,
    pub current_max_nodes: i32,
    pub available_pods: i64,
    pub available_cpu: f64,
    pub available_memory: f64,
    pub max_available_pods: i64,
    pub max_available_cpu: f64,
    pub max_available_memory: f64,
    /// Names of the daemon sets that landed on this pool.
    pub matched_daemon_sets: Vec<String>,
}

impl NodePoolResourceData {
    /// Subtracts every daemon set matching the pool's labels from one node's
    /// capacity, then scales by the current max-node bound.
    pub fn compute(shape: &NodePoolShape, daemon_sets: &[Workload]) -> Result<Self, MatchError> {
        let mut matched = Vec::new();
        let mut overhead_cpu = 0.0;
        let mut overhead_memory = 0.0;

        for daemon_set in daemon_sets {
            if daemon_set.matches(&shape.labels)? {
                overhead_cpu += daemon_set.cpu;
                overhead_memory += daemon_set.memory;
                matched.push(daemon_set.name.clone());
            }
        }

        let available_pods = shape.max_pods_per_node - matched.len() as i64;
        let available_cpu = shape.allocatable_cpu - overhead_cpu;
        let available_memory = shape.allocatable_memory - overhead_memory;
        let bound = shape.current_max_nodes;

        Ok(Self {
            name: shape.name.clone(),
            labels: shape.labels.clone(),
            current_node_count: shape.current_node_count,
            current_max_nodes: bound,
            available_pods,
            available_cpu,
            available_memory,
            max_available_pods: available_pods * i64::from(bound),
            max_available_cpu: available_cpu * f64::from(bound),
            max_available_memory: available_memory * f64::from(bound),
            matched_daemon_sets: matched,
        })
    }

    /// Whether the pool already runs at its max-node bound.
    pub fn is_saturated(&self) -> bool {
        self.current_node_count == self.current_max_nodes
    }
}

/// Running totals of what the event's workloads will ask of one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NodePoolRequestedResourceData {
    pub pods: i64,
    pub cpu: f64,
    pub memory: f64,
}

impl NodePoolRequestedResourceData {
    /// Adds `replicas` copies of a workload.
    pub fn add(&mut self, workload: &Workload, replicas: i32) {
        self.pods += i64::from(replicas);
        self.cpu += workload.cpu * f64::from(replicas);
        self.memory += workload.memory * f64::from(replicas);
    }
}

/// Outcome of sizing one pool.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SizingPlan {
    pub nodes_needed_cpu: f64,
    pub nodes_needed_memory: f64,
    pub nodes_needed_pods: f64,
    pub nodes_needed: i32,
    pub current_max_nodes: i32,
    pub new_max_nodes: i32,
}

impl SizingPlan {
    /// Whether the bound has to move.
    pub fn changed(&self) -> bool {
        self.new_max_nodes != self.current_max_nodes
    }
}

/// Computes the new max-node bound for a pool.
///
/// Each dimension is sized independently and the largest deficit wins. A
/// saturated pool is grown by the safety margin even with no deficit.
pub fn plan_node_pool(
    resource: &NodePoolResourceData,
    requested: &NodePoolRequestedResourceData,
) -> SizingPlan {
    let unfulfilled_cpu = (requested.cpu - resource.max_available_cpu).max(0.0);
    let unfulfilled_memory = (requested.memory - resource.max_available_memory).max(0.0);
    let unfulfilled_pods = (requested.pods - resource.max_available_pods).max(0);

    let nodes_needed_cpu = nodes_for(&resource.name, "cpu", unfulfilled_cpu, resource.available_cpu);
    let nodes_needed_memory = nodes_for(
        &resource.name,
        "memory",
        unfulfilled_memory,
        resource.available_memory,
    );
    let nodes_needed_pods = nodes_for(
        &resource.name,
        "pods",
        unfulfilled_pods as f64,
        resource.available_pods as f64,
    );

    let nodes_needed = nodes_needed_cpu
        .max(nodes_needed_memory)
        .max(nodes_needed_pods)
        .max(0.0) as i32;

    let new_max_nodes = if nodes_needed > 0 || resource.is_saturated() {
        resource
            .current_max_nodes
            .saturating_add(nodes_needed)
            .saturating_add(SAFETY_MARGIN)
    } else {
        resource.current_max_nodes
    };

    SizingPlan {
        nodes_needed_cpu,
        nodes_needed_memory,
        nodes_needed_pods,
        nodes_needed,
        current_max_nodes: resource.current_max_nodes,
        new_max_nodes,
    }
}

fn nodes_for(pool: &str, dimension: &str, unfulfilled: f64, per_node: f64) -> f64 {
    if unfulfilled <= 0.0 {
        return 0.0;
    }
    let needed = (unfulfilled / per_node).ceil();
    if needed.is_finite() && needed >= 0.0 {
        needed
    } else {
        warn!(
            node_pool = %pool,
            dimension,
            unfulfilled,
            per_node,
            "no per-node capacity left after daemon sets; dimension ignored"
        );
        0.0
    }
}
