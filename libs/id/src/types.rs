//! Identifier types for every persisted record.

use crate::define_id;

// Scheduling
define_id!(EventId, "event");
define_id!(ScheduledHpaId, "scheduled hpa");

// Cluster registry
define_id!(ClusterId, "cluster");
define_id!(DatacenterId, "datacenter");

// Capacity bookkeeping
define_id!(UpdatedNodePoolId, "updated node pool");
