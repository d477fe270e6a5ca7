//! Event execution engine.
//!
//! Drives one event from `PENDING` to `PRESCALED`: claims it, sizes the
//! cluster's node pools for the event's workloads, records the chosen
//! bounds, then widens the requested HPAs. Every outcome ends up in the
//! event's status and message; nothing is returned to the caller.

mod capacity;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use prescale_capacity::{MatchError, QuantityError};
use prescale_id::UpdatedNodePoolId;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{DbError, Repository, WriteRetry};
use crate::gateway::{ClientFactory, Gateway, GatewayError, HorizontalPodAutoscaler, HpaOverride, HpaVersion};
use crate::model::{
    Event, EventStatus, ScheduledHpaTarget, TargetStatus, UpdatedNodePool, HPA_NOT_FOUND, INTERRUPTED,
    NO_HPA_EXIST,
};
use crate::shutdown;

/// Why an execution failed. The display text becomes the event message.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{}", NO_HPA_EXIST)]
    NoHpaExist,

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("invalid node affinity: {0}")]
    Match(#[from] MatchError),

    #[error(transparent)]
    Quantity(#[from] QuantityError),
}

/// Executes events against their clusters.
pub struct EventExecutor {
    repo: Arc<dyn Repository>,
    clients: Arc<dyn ClientFactory>,
    retry: WriteRetry,
}

impl EventExecutor {
    pub fn new(repo: Arc<dyn Repository>, clients: Arc<dyn ClientFactory>) -> Self {
        Self {
            repo,
            clients,
            retry: WriteRetry::default(),
        }
    }

    pub fn with_write_retry(mut self, retry: WriteRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Runs one event to `PRESCALED` or `FAILED`. Returns without effect if
    /// the event is no longer pending.
    #[instrument(skip(self, event, shutdown), fields(event_id = %event.id, event = %event.name))]
    pub async fn execute(&self, event: Event, mut shutdown: watch::Receiver<bool>) {
        match self
            .repo
            .transition_event(event.id, EventStatus::Pending, EventStatus::Executing)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Event already claimed");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim event");
                return;
            }
        }
        info!(calculate_node_pool = event.calculate_node_pool, "Executing event");

        let outcome = tokio::select! {
            result = self.run(&event) => Some(result),
            _ = shutdown::requested(&mut shutdown) => None,
        };

        let (status, message) = match outcome {
            Some(Ok(())) => {
                info!("Event prescaled");
                (EventStatus::Prescaled, String::new())
            }
            Some(Err(_)) if *shutdown.borrow() => {
                warn!("Event execution interrupted");
                (EventStatus::Failed, INTERRUPTED.to_string())
            }
            Some(Err(e)) => {
                error!(error = %e, "Event execution failed");
                (EventStatus::Failed, e.to_string())
            }
            None => {
                warn!("Event execution interrupted");
                (EventStatus::Failed, INTERRUPTED.to_string())
            }
        };

        // A lost write leaves the event EXECUTING; nothing re-claims it.
        let recorded = self
            .retry
            .run("event status", || self.repo.set_event_status(event.id, status, &message))
            .await;
        if let Err(e) = recorded {
            error!(
                error = %e,
                status = %status,
                attempts = self.retry.attempts,
                "Failed to record event outcome; event stays EXECUTING until fixed by hand"
            );
        }
    }

    async fn run(&self, event: &Event) -> Result<(), ExecError> {
        let cluster = self.repo.get_cluster(event.cluster_id).await?;
        let gateway = self.clients.connect(&cluster).await?;

        let version = gateway.hpa_version(cluster.hpa_api_version.as_deref()).await?;
        debug!(cluster = %cluster.name, version = %version, "Resolved HPA version");

        let live: BTreeMap<String, HorizontalPodAutoscaler> = gateway
            .cluster
            .list_hpas(version)
            .await?
            .into_iter()
            .map(|hpa| (hpa.key(), hpa))
            .collect();

        let mut selected = Vec::new();
        for target in self.repo.list_targets(event.id).await? {
            if live.contains_key(&target.key()) {
                selected.push(target);
            } else {
                warn!(target = %target.key(), "Scheduled HPA not in cluster");
                self.repo
                    .set_target_status(target.id, TargetStatus::Failed, HPA_NOT_FOUND)
                    .await?;
            }
        }
        if selected.is_empty() {
            return Err(ExecError::NoHpaExist);
        }

        let definitions = gateway.list_node_pools().await?;
        let bounds = if event.calculate_node_pool {
            capacity::size_node_pools(&gateway, &definitions, &selected, &live).await?
        } else {
            definitions
                .iter()
                .map(|d| (d.name.clone(), d.max_nodes()))
                .collect()
        };

        let rows: Vec<UpdatedNodePool> = bounds
            .into_iter()
            .map(|(node_pool_name, max_node)| UpdatedNodePool {
                id: UpdatedNodePoolId::new(),
                event_id: event.id,
                node_pool_name,
                max_node,
            })
            .collect();
        self.repo.insert_updated_node_pools(&rows).await?;

        self.apply_overrides(&gateway, version, &selected).await
    }

    /// One update per target, concurrently. Each target records its own
    /// outcome; only a failure to record one fails the event.
    async fn apply_overrides(
        &self,
        gateway: &Gateway,
        version: HpaVersion,
        targets: &[ScheduledHpaTarget],
    ) -> Result<(), ExecError> {
        let results = join_all(targets.iter().map(|target| async move {
            let hpa_override = HpaOverride {
                namespace: target.namespace.clone(),
                name: target.name.clone(),
                min_replicas: target.min_replicas,
                max_replicas: target.max_replicas,
            };
            match gateway.cluster.update_hpa(version, &hpa_override).await {
                Ok(_) => {
                    self.repo
                        .set_target_status(target.id, TargetStatus::Success, "")
                        .await
                }
                Err(e) => {
                    warn!(target = %target.key(), error = %e, "HPA update failed");
                    self.repo
                        .set_target_status(target.id, TargetStatus::Failed, &e.to_string())
                        .await
                }
            }
        }))
        .await;

        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}
