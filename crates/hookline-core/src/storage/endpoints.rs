//! Repository for delivery endpoints.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{Endpoint, EndpointId},
};

/// Repository for endpoint rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts an endpoint.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the timeout does not fit a BIGINT.
    pub async fn create(&self, endpoint: &Endpoint) -> Result<()> {
        let timeout_ms = i64::try_from(endpoint.timeout_ms)
            .map_err(|_| CoreError::InvalidInput("timeout_ms out of range".to_string()))?;

        sqlx::query(
            r"
            INSERT INTO endpoints (
                id, workspace_id, name, url, method, headers,
                timeout_ms, enabled, retry, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(endpoint.id)
        .bind(endpoint.workspace_id)
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(endpoint.method)
        .bind(sqlx::types::Json(&endpoint.headers))
        .bind(timeout_ms)
        .bind(endpoint.enabled)
        .bind(sqlx::types::Json(&endpoint.retry))
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Finds an endpoint by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: EndpointId) -> Result<Option<Endpoint>> {
        let endpoint = sqlx::query_as::<_, Endpoint>(
            r"
            SELECT id, workspace_id, name, url, method, headers,
                   timeout_ms, enabled, retry, created_at, updated_at
            FROM endpoints
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(endpoint)
    }
}
