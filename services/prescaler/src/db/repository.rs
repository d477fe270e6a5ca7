//! Persistence seam consumed by the engine, watcher and scheduler.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prescale_id::{ClusterId, EventId, ScheduledHpaId};

use super::DbError;
use crate::model::{
    ClusterRecord, Event, EventStatus, HpaStatus, NodePoolStatus, ScheduledHpaTarget,
    TargetStatus, UpdatedNodePool,
};

/// Event, target and sample storage.
///
/// Soft-deleted rows are invisible through every method.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Pending events starting no later than `now + horizon`, oldest first.
    async fn find_pending_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Event>, DbError>;

    /// Prescaled events starting no later than `now + horizon`, oldest first.
    async fn find_prescaled_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Event>, DbError>;

    /// Marks every watching event whose end time is before `now` as
    /// succeeded. Returns the ids moved.
    async fn finish_watched(&self, now: DateTime<Utc>) -> Result<Vec<EventId>, DbError>;

    /// Moves an event from `from` to `to` only if it is still in `from`.
    /// Returns whether this caller won the transition.
    async fn transition_event(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    ) -> Result<bool, DbError>;

    async fn set_event_status(
        &self,
        id: EventId,
        status: EventStatus,
        message: &str,
    ) -> Result<(), DbError>;

    async fn set_event_message(&self, id: EventId, message: &str) -> Result<(), DbError>;

    async fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord, DbError>;

    async fn list_targets(&self, event_id: EventId) -> Result<Vec<ScheduledHpaTarget>, DbError>;

    async fn set_target_status(
        &self,
        id: ScheduledHpaId,
        status: TargetStatus,
        message: &str,
    ) -> Result<(), DbError>;

    /// Records the bounds chosen for an event. A pool already recorded for
    /// the event keeps its first row.
    async fn insert_updated_node_pools(&self, pools: &[UpdatedNodePool]) -> Result<(), DbError>;

    async fn list_updated_node_pools(
        &self,
        event_id: EventId,
    ) -> Result<Vec<UpdatedNodePool>, DbError>;

    async fn insert_node_pool_statuses(&self, rows: &[NodePoolStatus]) -> Result<(), DbError>;

    async fn insert_hpa_statuses(&self, rows: &[HpaStatus]) -> Result<(), DbError>;
}
