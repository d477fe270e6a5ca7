//! Scheduler background worker.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::config::env_or;
use crate::db::Repository;
use crate::engine::EventExecutor;
use crate::shutdown;
use crate::watcher::EventWatcher;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// How far ahead of its start a pending event is executed.
    pub execute_horizon: chrono::Duration,
    /// How far ahead of its start a prescaled event starts being watched.
    pub watch_horizon: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            execute_horizon: chrono::Duration::minutes(60),
            watch_horizon: chrono::Duration::minutes(55),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval: Duration::from_secs(env_or(
                "PRESCALE_TICK_SECS",
                defaults.tick_interval.as_secs(),
            )?),
            execute_horizon: chrono::Duration::minutes(env_or(
                "PRESCALE_EXECUTE_HORIZON_MINS",
                defaults.execute_horizon.num_minutes(),
            )?),
            watch_horizon: chrono::Duration::minutes(env_or(
                "PRESCALE_WATCH_HORIZON_MINS",
                defaults.watch_horizon.num_minutes(),
            )?),
        })
    }
}

/// Periodic driver dispatching executions and watches.
pub struct SchedulerWorker {
    repo: Arc<dyn Repository>,
    executor: Arc<EventExecutor>,
    watcher: Arc<EventWatcher>,
    config: SchedulerConfig,
}

impl SchedulerWorker {
    pub fn new(
        repo: Arc<dyn Repository>,
        executor: Arc<EventExecutor>,
        watcher: Arc<EventWatcher>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            executor,
            watcher,
            config,
        }
    }

    /// Run until shutdown is signaled, then wait for dispatched work.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            execute_horizon_mins = self.config.execute_horizon.num_minutes(),
            watch_horizon_mins = self.config.watch_horizon.num_minutes(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.config.tick_interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(&mut tasks, &shutdown).await;
                    while let Some(finished) = tasks.try_join_next() {
                        if let Err(e) = finished {
                            error!(error = %e, "Dispatched task panicked");
                        }
                    }
                }
                _ = shutdown::requested(&mut shutdown) => {
                    info!("Scheduler worker shutting down");
                    break;
                }
            }
        }

        info!(in_flight = tasks.len(), "Waiting for dispatched events");
        while let Some(finished) = tasks.join_next().await {
            if let Err(e) = finished {
                error!(error = %e, "Dispatched task panicked");
            }
        }
    }

    /// One pass: the three queries run concurrently, then matching events
    /// are dispatched.
    async fn tick(&self, tasks: &mut JoinSet<()>, shutdown: &watch::Receiver<bool>) {
        let now = Utc::now();
        let (pending, prescaled, finished) = tokio::join!(
            self.repo.find_pending_within(now, self.config.execute_horizon),
            self.repo.find_prescaled_within(now, self.config.watch_horizon),
            self.repo.finish_watched(now),
        );

        match pending {
            Ok(events) => {
                for event in events {
                    debug!(event_id = %event.id, "Dispatching execution");
                    let executor = self.executor.clone();
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move { executor.execute(event, shutdown).await });
                }
            }
            Err(e) => error!(error = %e, "Failed to query pending events"),
        }

        match prescaled {
            Ok(events) => {
                for event in events {
                    debug!(event_id = %event.id, "Dispatching watch");
                    let watcher = self.watcher.clone();
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move { watcher.watch(event, shutdown).await });
                }
            }
            Err(e) => error!(error = %e, "Failed to query prescaled events"),
        }

        match finished {
            Ok(ids) => {
                for id in ids {
                    info!(event_id = %id, "Event window over; marked succeeded");
                }
            }
            Err(e) => error!(error = %e, "Failed to finish watched events"),
        }
    }
}
