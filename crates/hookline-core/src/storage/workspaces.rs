//! Repository for workspaces.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    error::Result,
    models::{Workspace, WorkspaceId},
};

/// Repository for workspace rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns the shared pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Inserts a workspace.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, workspace: &Workspace) -> Result<()> {
        sqlx::query("INSERT INTO workspaces (id, name, created_at) VALUES ($1, $2, $3)")
            .bind(workspace.id)
            .bind(&workspace.name)
            .bind(workspace.created_at)
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    /// Finds a workspace by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: WorkspaceId) -> Result<Option<Workspace>> {
        let workspace = sqlx::query_as::<_, Workspace>(
            "SELECT id, name, created_at FROM workspaces WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;
        Ok(workspace)
    }
}
