//! Domain records shared by the store, the gateway and the engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use prescale_id::{ClusterId, DatacenterId, EventId, ScheduledHpaId, UpdatedNodePoolId};
use serde::{Deserialize, Serialize};

/// Event message when none of the event's targets exist in the cluster.
pub const NO_HPA_EXIST: &str = "no hpa exist";

/// Target message when the named HPA is not in the cluster.
pub const HPA_NOT_FOUND: &str = "hpa not found";

/// Event message when the process stops mid-execution.
pub const INTERRUPTED: &str = "interrupted by shutdown";

/// Lifecycle of a scheduled event.
///
/// `Pending → Executing → Prescaled → Watching → Success`, or `Failed` from
/// any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Executing,
    Prescaled,
    Watching,
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Executing => "EXECUTING",
            EventStatus::Prescaled => "PRESCALED",
            EventStatus::Watching => "WATCHING",
            EventStatus::Success => "SUCCESS",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => EventStatus::Pending,
            "EXECUTING" => EventStatus::Executing,
            "PRESCALED" => EventStatus::Prescaled,
            "WATCHING" => EventStatus::Watching,
            "SUCCESS" => EventStatus::Success,
            "FAILED" => EventStatus::Failed,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Outcome of applying one HPA override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetStatus {
    Pending,
    Success,
    Failed,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::Pending => "PENDING",
            TargetStatus::Success => "SUCCESS",
            TargetStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => TargetStatus::Pending,
            "SUCCESS" => TargetStatus::Success,
            "FAILED" => TargetStatus::Failed,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// A status column held a value no variant maps to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status '{0}'")]
pub struct UnknownStatus(pub String);

/// A scheduled traffic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: EventStatus,
    pub message: String,
    /// Whether node-pool bounds are sized for this event or only HPAs edited.
    pub calculate_node_pool: bool,
    pub cluster_id: ClusterId,
}

/// Requested HPA bounds for one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledHpaTarget {
    pub id: ScheduledHpaId,
    pub event_id: EventId,
    pub name: String,
    pub namespace: String,
    pub min_replicas: Option<i32>,
    pub max_replicas: i32,
    pub status: TargetStatus,
    pub message: String,
}

impl ScheduledHpaTarget {
    /// `namespace/name`, the key live HPAs are matched on.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Max-node bound chosen for one pool during an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedNodePool {
    pub id: UpdatedNodePoolId,
    pub event_id: EventId,
    pub node_pool_name: String,
    pub max_node: i32,
}

/// One node-count sample for a tracked pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolStatus {
    pub updated_node_pool_id: UpdatedNodePoolId,
    pub node_count: i32,
    pub created_at: DateTime<Utc>,
}

/// One replica sample for a target's deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HpaStatus {
    pub scheduled_hpa_id: ScheduledHpaId,
    pub replicas: i32,
    pub available_replicas: i32,
    pub ready_replicas: i32,
    pub unavailable_replicas: i32,
    pub created_at: DateTime<Utc>,
}

/// Cloud account a cluster belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatacenterRecord {
    pub id: DatacenterId,
    pub name: String,
    /// Opaque credential material, interpreted by the gateway.
    pub credentials: serde_json::Value,
}

/// Registered cluster plus the datacenter that owns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub id: ClusterId,
    /// Provider-qualified name, `gke_{project}_{cluster}_{location}`.
    pub name: String,
    pub server_endpoint: String,
    /// Cluster CA, base64 or PEM.
    pub certificate: String,
    /// `autoscaling/<version>` last seen on the API server, if recorded.
    pub hpa_api_version: Option<String>,
    pub datacenter: DatacenterRecord,
}
