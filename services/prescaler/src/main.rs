//! Prescaler
//!
//! Grows node pools and widens HPAs ahead of scheduled traffic events, then
//! samples the cluster while the event runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use prescale_engine::{
    config,
    db::{Database, Repository},
    engine::EventExecutor,
    gateway::{ClientFactory, CredentialCache, GkeClientFactory},
    scheduler::SchedulerWorker,
    watcher::EventWatcher,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PRESCALE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting prescaler");
    info!(
        tick_secs = config.scheduler.tick_interval.as_secs(),
        gke_api = %config.gke.api_base,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let repo: Arc<dyn Repository> = Arc::new(db.repository());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let credentials = Arc::new(CredentialCache::new(
        http.clone(),
        config.gke.metadata_token_url.clone(),
    ));
    let clients: Arc<dyn ClientFactory> =
        Arc::new(GkeClientFactory::new(http, credentials, config.gke.clone()));

    let executor = Arc::new(EventExecutor::new(repo.clone(), clients.clone()));
    let watcher = Arc::new(EventWatcher::new(
        repo.clone(),
        clients.clone(),
        config.watcher.clone(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_worker = SchedulerWorker::new(repo, executor, watcher, config.scheduler.clone());
    let mut scheduler_handle = tokio::spawn(async move {
        scheduler_worker.run(shutdown_rx).await;
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = &mut scheduler_handle => {
            match result {
                Ok(()) => warn!("Scheduler worker exited unexpectedly"),
                Err(e) => error!(error = %e, "Scheduler worker panicked"),
            }
            return Ok(());
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight events to shut down...");
    let shutdown_timeout = Duration::from_secs(30);
    if tokio::time::timeout(shutdown_timeout, scheduler_handle).await.is_err() {
        warn!("Scheduler worker did not shut down in time");
    }

    info!("Prescaler shutdown complete");
    Ok(())
}

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
