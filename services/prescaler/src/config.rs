use std::time::Duration;

use anyhow::{Context, Result};

use crate::db::DbConfig;
use crate::gateway::GkeConfig;
use crate::scheduler::SchedulerConfig;
use crate::watcher::WatcherConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub dev_mode: bool,
    pub database: DbConfig,
    pub scheduler: SchedulerConfig,
    pub watcher: WatcherConfig,
    pub gke: GkeConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("PRESCALE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("PRESCALE_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let scheduler = SchedulerConfig::from_env()?;

        let watcher = WatcherConfig {
            interval: Duration::from_secs(env_or("PRESCALE_WATCH_INTERVAL_SECS", 30)?),
        };

        let mut gke = GkeConfig::default();
        if let Ok(base) = std::env::var("PRESCALE_GKE_API_BASE") {
            gke.api_base = base.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("PRESCALE_METADATA_TOKEN_URL") {
            gke.metadata_token_url = url;
        }
        if let Ok(manager) = std::env::var("PRESCALE_FIELD_MANAGER") {
            gke.field_manager = manager;
        }

        Ok(Self {
            log_level,
            dev_mode,
            database: DbConfig::from_env()?,
            scheduler,
            watcher,
            gke,
        })
    }
}

/// Reads and parses `key`, falling back to `default` when unset. A set but
/// unparseable value is an error rather than a silent default.
pub(crate) fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}
