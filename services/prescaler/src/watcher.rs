//! Event watcher.
//!
//! Samples a prescaled event's cluster until the event ends: node counts
//! for every pool whose bound was recorded, and replica counts of the
//! deployment behind every target. Sampling is best effort; failures are
//! logged and written to the event message, and the loop carries on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use prescale_id::{EventId, ScheduledHpaId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{DbError, Repository, WriteRetry};
use crate::gateway::{ClientFactory, Gateway, GatewayError, NODE_POOL_LABEL};
use crate::model::{ClusterRecord, Event, EventStatus, HpaStatus, NodePoolStatus, UpdatedNodePool};
use crate::shutdown;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Time between sample rounds.
    pub interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// A target whose replicas are sampled.
#[derive(Debug, Clone)]
struct WatchedTarget {
    id: ScheduledHpaId,
    namespace: String,
    deployment: String,
}

/// Everything one sample round needs, cheap to clone into a task.
#[derive(Clone)]
struct Sampler {
    repo: Arc<dyn Repository>,
    clients: Arc<dyn ClientFactory>,
    cluster: Arc<ClusterRecord>,
    event_id: EventId,
    pools: Arc<Vec<UpdatedNodePool>>,
    targets: Arc<Vec<WatchedTarget>>,
}

impl Sampler {
    /// Connects afresh so credentials are current, then runs both samplers.
    async fn round(self) {
        let gateway = match self.clients.connect(&self.cluster).await {
            Ok(gateway) => gateway,
            Err(e) => {
                self.record_failure("connect", &e.to_string()).await;
                return;
            }
        };

        let (nodes, hpas) = tokio::join!(self.sample_nodes(&gateway), self.sample_hpas(&gateway));
        if let Err(e) = nodes {
            self.record_failure("node pool sampling", &e.to_string()).await;
        }
        if let Err(e) = hpas {
            self.record_failure("hpa sampling", &e.to_string()).await;
        }
    }

    async fn sample_nodes(&self, gateway: &Gateway) -> Result<(), SampleError> {
        let nodes = gateway.cluster.list_nodes(None).await?;
        let mut counts: HashMap<&str, i32> = HashMap::new();
        for node in &nodes {
            if let Some(pool) = node
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(NODE_POOL_LABEL))
            {
                *counts.entry(pool.as_str()).or_default() += 1;
            }
        }

        let now = Utc::now();
        let rows: Vec<NodePoolStatus> = self
            .pools
            .iter()
            .map(|pool| NodePoolStatus {
                updated_node_pool_id: pool.id,
                node_count: counts.get(pool.node_pool_name.as_str()).copied().unwrap_or(0),
                created_at: now,
            })
            .collect();
        self.repo.insert_node_pool_statuses(&rows).await?;
        debug!(pools = rows.len(), "Sampled node counts");
        Ok(())
    }

    async fn sample_hpas(&self, gateway: &Gateway) -> Result<(), SampleError> {
        let fetched = join_all(self.targets.iter().map(|target| async move {
            let deployment = gateway
                .cluster
                .get_deployment(&target.namespace, &target.deployment)
                .await?;
            let status = deployment.status.unwrap_or_default();
            Ok::<_, GatewayError>(HpaStatus {
                scheduled_hpa_id: target.id,
                replicas: status.replicas.unwrap_or(0),
                available_replicas: status.available_replicas.unwrap_or(0),
                ready_replicas: status.ready_replicas.unwrap_or(0),
                unavailable_replicas: status.unavailable_replicas.unwrap_or(0),
                created_at: Utc::now(),
            })
        }))
        .await;

        let mut rows = Vec::with_capacity(fetched.len());
        let mut failures = Vec::new();
        for (target, result) in self.targets.iter().zip(fetched) {
            match result {
                Ok(row) => rows.push(row),
                Err(e) => failures.push(format!("{}/{}: {e}", target.namespace, target.deployment)),
            }
        }

        self.repo.insert_hpa_statuses(&rows).await?;
        debug!(targets = rows.len(), failed = failures.len(), "Sampled replicas");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SampleError::Targets(failures.join("; ")))
        }
    }

    async fn record_failure(&self, what: &str, error: &str) {
        warn!(event_id = %self.event_id, what, error, "Sampling failed");
        let message = format!("{what} failed: {error}");
        if let Err(e) = self.repo.set_event_message(self.event_id, &message).await {
            error!(event_id = %self.event_id, error = %e, "Failed to record sampling failure");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SampleError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error("{0}")]
    Targets(String),
}

/// Watches prescaled events.
pub struct EventWatcher {
    repo: Arc<dyn Repository>,
    clients: Arc<dyn ClientFactory>,
    config: WatcherConfig,
    retry: WriteRetry,
}

impl EventWatcher {
    pub fn new(repo: Arc<dyn Repository>, clients: Arc<dyn ClientFactory>, config: WatcherConfig) -> Self {
        Self {
            repo,
            clients,
            config,
            retry: WriteRetry::default(),
        }
    }

    /// Samples `event` every interval until its end time or shutdown.
    /// Returns without effect if the event is no longer prescaled.
    #[instrument(skip(self, event, shutdown), fields(event_id = %event.id, event = %event.name))]
    pub async fn watch(&self, event: Event, mut shutdown: watch::Receiver<bool>) {
        match self
            .repo
            .transition_event(event.id, EventStatus::Prescaled, EventStatus::Watching)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Event already being watched");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim event for watching");
                return;
            }
        }

        let sampler = match self.prepare(&event).await {
            Ok(sampler) => sampler,
            Err(e) => {
                error!(error = %e, "Failed to prepare watch");
                let message = format!("watch setup failed: {e}");
                let recorded = self
                    .retry
                    .run("event message", || self.repo.set_event_message(event.id, &message))
                    .await;
                if let Err(db_err) = recorded {
                    error!(error = %db_err, "Failed to record watch failure");
                }
                return;
            }
        };

        let remaining = (event.end_time - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let deadline = Instant::now() + remaining;
        info!(
            pools = sampler.pools.len(),
            targets = sampler.targets.len(),
            remaining_secs = remaining.as_secs(),
            "Watching event"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // First round one interval after entry.
        interval.tick().await;

        let mut rounds = JoinSet::new();
        loop {
            tokio::select! {
                tick = interval.tick() => {
                    if tick > deadline {
                        info!("Event window over");
                        break;
                    }
                    rounds.spawn(sampler.clone().round());
                    while let Some(finished) = rounds.try_join_next() {
                        if let Err(e) = finished {
                            error!(error = %e, "Sample round panicked");
                        }
                    }
                }
                _ = shutdown::requested(&mut shutdown) => {
                    info!("Watcher shutting down");
                    break;
                }
            }
        }

        while let Some(finished) = rounds.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Sample round panicked");
            }
        }
    }

    /// Loads the tracked pools and resolves each target's deployment.
    async fn prepare(&self, event: &Event) -> Result<Sampler, SetupError> {
        let cluster = self.repo.get_cluster(event.cluster_id).await?;
        let pools = self.repo.list_updated_node_pools(event.id).await?;
        let targets = self.repo.list_targets(event.id).await?;

        let gateway = self.clients.connect(&cluster).await?;
        let version = gateway.hpa_version(cluster.hpa_api_version.as_deref()).await?;
        let live: HashMap<String, _> = gateway
            .cluster
            .list_hpas(version)
            .await?
            .into_iter()
            .map(|hpa| (hpa.key(), hpa))
            .collect();

        let mut watched = Vec::new();
        for target in &targets {
            let Some(hpa) = live.get(&target.key()) else {
                debug!(target = %target.key(), "Target HPA gone; not sampling");
                continue;
            };
            match hpa.scale_target_ref.deployment_name() {
                Ok(deployment) => watched.push(WatchedTarget {
                    id: target.id,
                    namespace: target.namespace.clone(),
                    deployment: deployment.to_string(),
                }),
                Err(e) => warn!(target = %target.key(), error = %e, "Target not sampled"),
            }
        }

        Ok(Sampler {
            repo: self.repo.clone(),
            clients: self.clients.clone(),
            cluster: Arc::new(cluster),
            event_id: event.id,
            pools: Arc::new(pools),
            targets: Arc::new(watched),
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum SetupError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_interval() {
        assert_eq!(WatcherConfig::default().interval, Duration::from_secs(30));
    }
}
