//! Persistence layer.
//!
//! This module provides:
//! - Connection pool management and runtime migrations
//! - The [`Repository`] trait the engine, watcher and scheduler consume
//! - A Postgres implementation and an in-memory one for tests
//!
//! The Postgres layer uses SQLx without compile-time query checking.

mod error;
mod memory;
mod postgres;
mod repository;
mod retry;

pub use error::DbError;
pub use memory::MemoryRepository;
pub use postgres::PgRepository;
pub use repository::Repository;
pub use retry::WriteRetry;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::env_or;

/// Pool settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/prescale".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// `DATABASE_URL`, `DB_MAX_CONNECTIONS` and `DB_MIN_CONNECTIONS`; unset
    /// values keep their defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            ..defaults
        })
    }
}

/// Owns the Postgres pool the repository runs on.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(DbError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies `migrations/`, found next to the working directory or the
    /// crate.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let candidates = [
            PathBuf::from("migrations"),
            PathBuf::from("services/prescaler/migrations"),
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];

        let mut last_error = None;
        for dir in &candidates {
            match Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), migrations = migrator.iter().count(), "Applying migrations");
                    return migrator.run(&self.pool).await.map_err(DbError::Migration);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(DbError::MigrationDirNotFound {
            tried: candidates
                .iter()
                .map(|dir| dir.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    pub fn repository(&self) -> PgRepository {
        PgRepository::new(self.pool.clone())
    }
}
