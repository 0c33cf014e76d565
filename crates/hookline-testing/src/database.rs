//! Isolated PostgreSQL databases for repository tests.
//!
//! Each [`TestDatabase`] is a fresh database created on the server named by
//! `DATABASE_URL` and migrated with the workspace migrations. When
//! `DATABASE_URL` is not set there is nothing to test against, and
//! [`TestDatabase::from_env`] returns `None` so the caller can skip.

use std::time::Duration;

use anyhow::{Context, Result};
use hookline_core::storage::Storage;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, info};
use uuid::Uuid;

/// A migrated database owned by one test.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    admin: PgPool,
    database_name: String,
}

impl TestDatabase {
    /// Creates and migrates a database, or returns `None` when
    /// `DATABASE_URL` is unset.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is configured but unreachable, or the
    /// migrations fail.
    pub async fn from_env() -> Result<Option<Self>> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            info!("DATABASE_URL not set, skipping database test");
            return Ok(None);
        };
        let options: PgConnectOptions =
            database_url.parse().context("failed to parse DATABASE_URL")?;

        let admin = admin_pool(&options).await?;
        let database_name = format!("hookline_test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin)
            .await
            .with_context(|| format!("failed to create database {database_name}"))?;

        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options.database(&database_name))
            .await
            .with_context(|| format!("failed to connect to {database_name}"))?;

        sqlx::migrate!("../../migrations").run(&pool).await.context("failed to run migrations")?;
        debug!(database = %database_name, "created test database");

        Ok(Some(Self { pool, admin, database_name }))
    }

    /// Connection pool for this database.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Repositories over this database.
    pub fn storage(&self) -> Storage {
        Storage::new(self.pool.clone())
    }

    /// Name of the created database.
    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    /// Closes the pool and drops the database.
    ///
    /// # Errors
    ///
    /// Returns an error if the drop fails.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;
        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.database_name))
            .execute(&self.admin)
            .await
            .with_context(|| format!("failed to drop database {}", self.database_name))?;
        self.admin.close().await;
        Ok(())
    }
}

/// Pool on the server's `postgres` database for CREATE and DROP. Tests run
/// on separate runtimes, so each database gets its own.
async fn admin_pool(options: &PgConnectOptions) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options.clone().database("postgres"))
        .await
        .context("failed to connect to admin database")
}
