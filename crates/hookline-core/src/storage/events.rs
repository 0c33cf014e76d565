//! Repository for ingested events.
//!
//! Events are written by ingestion and only read by the delivery engine.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Event, EventId},
};

/// Repository for event rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an event.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, event: &Event) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO events (id, workspace_id, data, created_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(event.id)
        .bind(event.workspace_id)
        .bind(&event.data)
        .bind(event.created_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Finds an event by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EventId) -> Result<Option<Event>> {
        let event = sqlx::query_as::<_, Event>(
            "SELECT id, workspace_id, data, created_at FROM events WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(event)
    }
}
