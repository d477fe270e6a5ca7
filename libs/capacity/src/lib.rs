//! Capacity planning primitives for event prescaling.
//!
//! Given a node pool's shape (one representative node, its autoscaling
//! bound) and the workloads that will run during an event, this crate
//! decides how far the pool's max-node bound has to move.
//!
//! - [`matcher`]: does a workload's node selector / required affinity admit
//!   a pool's representative labels
//! - [`quantity`]: Kubernetes resource quantities as approximate floats
//! - [`workload`]: per-replica CPU/memory demand of a pod template
//! - [`model`]: available vs requested resources and the sizing decision
//!
//! # Invariants
//!
//! - Sizing is deterministic given the same inputs
//! - A bound only ever grows, and only by `nodes_needed + SAFETY_MARGIN`
//! - Matcher errors are returned, never swallowed into "no match"

pub mod error;
pub mod matcher;
pub mod model;
pub mod quantity;
pub mod workload;

pub use error::{MatchError, QuantityError};
pub use matcher::matches;
pub use model::{
    plan_node_pool, NodePoolRequestedResourceData, NodePoolResourceData, NodePoolShape,
    SizingPlan, SAFETY_MARGIN,
};
pub use quantity::parse_quantity;
pub use workload::{Workload, DEFAULT_REPLICAS};
