//! PostgreSQL repositories backing the attempt ledger.
//!
//! One repository per table. All of them share a pooled connection and
//! return [`crate::error::CoreError`] on failure.

use std::sync::Arc;

use sqlx::PgPool;

pub mod attempt_details;
pub mod attempts;
pub mod endpoints;
pub mod events;
pub mod workspaces;

use crate::error::Result;

/// Container for all ledger repositories.
#[derive(Clone)]
pub struct Storage {
    /// Workspace lookups.
    pub workspaces: Arc<workspaces::Repository>,

    /// Event lookups.
    pub events: Arc<events::Repository>,

    /// Endpoint lookups.
    pub endpoints: Arc<endpoints::Repository>,

    /// Attempt lifecycle.
    pub attempts: Arc<attempts::Repository>,

    /// Attempt request/response captures.
    pub attempt_details: Arc<attempt_details::Repository>,
}

impl Storage {
    /// Creates the repositories over a shared pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            workspaces: Arc::new(workspaces::Repository::new(pool.clone())),
            events: Arc::new(events::Repository::new(pool.clone())),
            endpoints: Arc::new(endpoints::Repository::new(pool.clone())),
            attempts: Arc::new(attempts::Repository::new(pool.clone())),
            attempt_details: Arc::new(attempt_details::Repository::new(pool)),
        }
    }

    /// Verifies the database answers queries.
    ///
    /// # Errors
    ///
    /// Returns error if the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.workspaces.pool()).await?;
        Ok(())
    }
}
