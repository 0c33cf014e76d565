//! Repository for attempt lifecycle operations.
//!
//! Status transitions are last-write-wins per attempt id. The one exception
//! is the bulk status flip used when scheduling, which never moves an attempt
//! out of a terminal state: a reconciler sweep racing a worker must not undo
//! a recorded outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{Attempt, AttemptErrorCode, AttemptId, AttemptResult, AttemptStatus},
};

const SELECT_COLUMNS: &str = r"
    SELECT id, event_id, endpoint_id, workspace_id, attempt_number, status,
           scheduled_at, attempted_at, trigger_mode, error_code,
           request, response, exhausted, created_at
    FROM attempts
";

/// Repository for attempt rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new attempt.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, attempt: &Attempt) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO attempts (
                id, event_id, endpoint_id, workspace_id, attempt_number, status,
                scheduled_at, attempted_at, trigger_mode, error_code,
                request, response, exhausted, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(attempt.id)
        .bind(attempt.event_id)
        .bind(attempt.endpoint_id)
        .bind(attempt.workspace_id)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(attempt.status)
        .bind(attempt.scheduled_at)
        .bind(attempt.attempted_at)
        .bind(attempt.trigger_mode)
        .bind(attempt.error_code)
        .bind(attempt.request.as_ref().map(sqlx::types::Json))
        .bind(attempt.response.as_ref().map(sqlx::types::Json))
        .bind(attempt.exhausted)
        .bind(attempt.created_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    /// Finds an attempt by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: AttemptId) -> Result<Option<Attempt>> {
        let query = format!("{SELECT_COLUMNS} WHERE id = $1");
        let attempt =
            sqlx::query_as::<_, Attempt>(&query).bind(id).fetch_optional(&*self.pool).await?;
        Ok(attempt)
    }

    /// Lists `Init` attempts that are due and were created before
    /// `created_before`, oldest schedule first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_unqueued(
        &self,
        limit: usize,
        created_before: DateTime<Utc>,
        due_before: DateTime<Utc>,
    ) -> Result<Vec<Attempt>> {
        let query = format!(
            "{SELECT_COLUMNS} WHERE status = 'init' AND created_at <= $1 AND scheduled_at <= $2 \
             ORDER BY scheduled_at ASC LIMIT $3"
        );
        let attempts = sqlx::query_as::<_, Attempt>(&query)
            .bind(created_before)
            .bind(due_before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;
        Ok(attempts)
    }

    /// Sets the status of every non-terminal attempt in `ids`.
    ///
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn update_status(&self, ids: &[AttemptId], status: AttemptStatus) -> Result<u64> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let result = sqlx::query(
            r"
            UPDATE attempts SET status = $1
            WHERE id = ANY($2) AND status NOT IN ('success', 'failure', 'canceled')
            ",
        )
        .bind(status)
        .bind(ids)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Moves every `Queued` attempt back to `Init` so the reconciler picks it
    /// up again. Used when the queue that held their tasks is gone.
    ///
    /// Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn reset_queued(&self) -> Result<u64> {
        let result = sqlx::query("UPDATE attempts SET status = 'init' WHERE status = 'queued'")
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Finalizes an attempt that never reached delivery.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn update_error_code(
        &self,
        id: AttemptId,
        status: AttemptStatus,
        error_code: AttemptErrorCode,
    ) -> Result<()> {
        sqlx::query("UPDATE attempts SET status = $1, error_code = $2 WHERE id = $3")
            .bind(status)
            .bind(error_code)
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Records the outcome of an executed delivery.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn update_delivery(&self, id: AttemptId, result: &AttemptResult) -> Result<()> {
        sqlx::query(
            r"
            UPDATE attempts SET
                status = $1,
                error_code = $2,
                request = $3,
                response = $4,
                attempted_at = $5,
                exhausted = $6
            WHERE id = $7
            ",
        )
        .bind(result.status)
        .bind(result.error_code)
        .bind(result.request.as_ref().map(sqlx::types::Json))
        .bind(result.response.as_ref().map(sqlx::types::Json))
        .bind(result.attempted_at)
        .bind(result.exhausted)
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}
