//! In-process repository for tests and dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use prescale_id::{ClusterId, EventId, ScheduledHpaId};

use super::{DbError, Repository};
use crate::model::{
    ClusterRecord, Event, EventStatus, HpaStatus, NodePoolStatus, ScheduledHpaTarget,
    TargetStatus, UpdatedNodePool,
};

#[derive(Default)]
struct State {
    events: HashMap<EventId, Event>,
    clusters: HashMap<ClusterId, ClusterRecord>,
    targets: Vec<ScheduledHpaTarget>,
    updated_node_pools: Vec<UpdatedNodePool>,
    node_pool_statuses: Vec<NodePoolStatus>,
    hpa_statuses: Vec<HpaStatus>,
    fail_queries: bool,
    failing_writes: u32,
}

/// Repository holding everything in memory behind one mutex.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, state: &State) -> Result<(), DbError> {
        if state.fail_queries {
            return Err(DbError::Query(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    /// `check`, then spends one injected write failure if any are left.
    fn check_write(&self, state: &mut State) -> Result<(), DbError> {
        self.check(state)?;
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(DbError::Query(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    pub fn insert_cluster(&self, cluster: ClusterRecord) {
        self.lock().clusters.insert(cluster.id, cluster);
    }

    pub fn insert_event(&self, event: Event) {
        self.lock().events.insert(event.id, event);
    }

    pub fn insert_target(&self, target: ScheduledHpaTarget) {
        self.lock().targets.push(target);
    }

    /// Makes every subsequent call fail as if the pool were unavailable.
    pub fn set_failing(&self, failing: bool) {
        self.lock().fail_queries = failing;
    }

    /// Makes the next `count` event status or message writes fail.
    pub fn fail_event_writes(&self, count: u32) {
        self.lock().failing_writes = count;
    }

    pub fn event(&self, id: EventId) -> Option<Event> {
        self.lock().events.get(&id).cloned()
    }

    pub fn targets(&self, event_id: EventId) -> Vec<ScheduledHpaTarget> {
        self.lock()
            .targets
            .iter()
            .filter(|t| t.event_id == event_id)
            .cloned()
            .collect()
    }

    pub fn updated_node_pools(&self) -> Vec<UpdatedNodePool> {
        self.lock().updated_node_pools.clone()
    }

    pub fn node_pool_statuses(&self) -> Vec<NodePoolStatus> {
        self.lock().node_pool_statuses.clone()
    }

    pub fn hpa_statuses(&self) -> Vec<HpaStatus> {
        self.lock().hpa_statuses.clone()
    }

    fn events_starting_before(
        &self,
        status: EventStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Event>, DbError> {
        let state = self.lock();
        self.check(&state)?;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.status == status && e.start_time <= before)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_time);
        Ok(events)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_pending_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Event>, DbError> {
        self.events_starting_before(EventStatus::Pending, now + horizon)
    }

    async fn find_prescaled_within(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<Event>, DbError> {
        self.events_starting_before(EventStatus::Prescaled, now + horizon)
    }

    async fn finish_watched(&self, now: DateTime<Utc>) -> Result<Vec<EventId>, DbError> {
        let mut state = self.lock();
        self.check(&state)?;
        let mut moved = Vec::new();
        for event in state.events.values_mut() {
            if event.status == EventStatus::Watching && event.end_time < now {
                event.status = EventStatus::Success;
                moved.push(event.id);
            }
        }
        Ok(moved)
    }

    async fn transition_event(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    ) -> Result<bool, DbError> {
        let mut state = self.lock();
        self.check(&state)?;
        match state.events.get_mut(&id) {
            Some(event) if event.status == from => {
                event.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_event_status(
        &self,
        id: EventId,
        status: EventStatus,
        message: &str,
    ) -> Result<(), DbError> {
        let mut state = self.lock();
        self.check_write(&mut state)?;
        let event = state
            .events
            .get_mut(&id)
            .ok_or_else(|| DbError::not_found("event", id))?;
        event.status = status;
        event.message = message.to_string();
        Ok(())
    }

    async fn set_event_message(&self, id: EventId, message: &str) -> Result<(), DbError> {
        let mut state = self.lock();
        self.check_write(&mut state)?;
        if let Some(event) = state.events.get_mut(&id) {
            event.message = message.to_string();
        }
        Ok(())
    }

    async fn get_cluster(&self, id: ClusterId) -> Result<ClusterRecord, DbError> {
        let state = self.lock();
        self.check(&state)?;
        state
            .clusters
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("cluster", id))
    }

    async fn list_targets(&self, event_id: EventId) -> Result<Vec<ScheduledHpaTarget>, DbError> {
        let state = self.lock();
        self.check(&state)?;
        Ok(state
            .targets
            .iter()
            .filter(|t| t.event_id == event_id)
            .cloned()
            .collect())
    }

    async fn set_target_status(
        &self,
        id: ScheduledHpaId,
        status: TargetStatus,
        message: &str,
    ) -> Result<(), DbError> {
        let mut state = self.lock();
        self.check(&state)?;
        if let Some(target) = state.targets.iter_mut().find(|t| t.id == id) {
            target.status = status;
            target.message = message.to_string();
        }
        Ok(())
    }

    async fn insert_updated_node_pools(&self, pools: &[UpdatedNodePool]) -> Result<(), DbError> {
        let mut state = self.lock();
        self.check(&state)?;
        for pool in pools {
            let exists = state
                .updated_node_pools
                .iter()
                .any(|p| p.event_id == pool.event_id && p.node_pool_name == pool.node_pool_name);
            if !exists {
                state.updated_node_pools.push(pool.clone());
            }
        }
        Ok(())
    }

    async fn list_updated_node_pools(
        &self,
        event_id: EventId,
    ) -> Result<Vec<UpdatedNodePool>, DbError> {
        let state = self.lock();
        self.check(&state)?;
        let mut pools: Vec<UpdatedNodePool> = state
            .updated_node_pools
            .iter()
            .filter(|p| p.event_id == event_id)
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.node_pool_name.cmp(&b.node_pool_name));
        Ok(pools)
    }

    async fn insert_node_pool_statuses(&self, rows: &[NodePoolStatus]) -> Result<(), DbError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.node_pool_statuses.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_hpa_statuses(&self, rows: &[HpaStatus]) -> Result<(), DbError> {
        let mut state = self.lock();
        self.check(&state)?;
        state.hpa_statuses.extend_from_slice(rows);
        Ok(())
    }
}
