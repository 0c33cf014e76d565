//! Repository for attempt request/response captures.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{AttemptDetail, AttemptId},
};

/// Repository for attempt detail rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts or replaces the detail for an attempt.
    ///
    /// A re-executed attempt overwrites the previous capture.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, detail: &AttemptDetail) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO attempt_details (
                id, workspace_id, request_headers, request_body,
                response_headers, response_body
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                request_headers = EXCLUDED.request_headers,
                request_body = EXCLUDED.request_body,
                response_headers = EXCLUDED.response_headers,
                response_body = EXCLUDED.response_body,
                updated_at = NOW()
            ",
        )
        .bind(detail.id)
        .bind(detail.workspace_id)
        .bind(sqlx::types::Json(&detail.request_headers))
        .bind(&detail.request_body)
        .bind(detail.response_headers.as_ref().map(sqlx::types::Json))
        .bind(&detail.response_body)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Finds the detail for an attempt.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: AttemptId) -> Result<Option<AttemptDetail>> {
        let detail = sqlx::query_as::<_, AttemptDetail>(
            r"
            SELECT id, workspace_id, request_headers, request_body,
                   response_headers, response_body
            FROM attempt_details
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(detail)
    }
}
