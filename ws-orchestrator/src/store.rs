//! Row-level access to the `workspaces` and `ports` tables.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::workspace::{Port, Workspace, WorkspaceStatus};

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a workspace in `creating`; a taken name is a conflict.
    #[instrument(skip(self))]
    pub async fn insert(&self, name: &str, image: &str) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, name, status, image, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(WorkspaceStatus::Creating)
        .bind(image)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OrchestratorError::Conflict(format!("workspace '{}' already exists", name))
            } else {
                e.into()
            }
        })?;

        self.get(&id)
            .await?
            .ok_or_else(|| OrchestratorError::Internal(format!("workspace {} vanished", id)))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces ORDER BY created_at, name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_by_status(&self, status: WorkspaceStatus) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM workspaces WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Move `id` from `from` to `to` only if it is still in `from`.
    ///
    /// Returns `false` when the row changed underneath the caller.
    #[instrument(skip(self))]
    pub async fn transition(
        &self,
        id: &str,
        from: WorkspaceStatus,
        to: WorkspaceStatus,
        clear_error: bool,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET status = ?, updated_at = ?,
                error_message = CASE WHEN ? THEN NULL ELSE error_message END
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(to)
        .bind(now)
        .bind(clear_error)
        .bind(id)
        .bind(from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Publish `vm_ip` and move a `creating` (or already `running`) row to
    /// `running`. Returns `false` if the row is gone or has moved on.
    #[instrument(skip(self))]
    pub async fn mark_running(&self, id: &str, vm_ip: &str) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            r#"
            UPDATE workspaces
            SET status = ?, vm_ip = ?, error_message = NULL, updated_at = ?
            WHERE id = ? AND status IN (?, ?)
            "#,
        )
        .bind(WorkspaceStatus::Running)
        .bind(vm_ip)
        .bind(now)
        .bind(id)
        .bind(WorkspaceStatus::Creating)
        .bind(WorkspaceStatus::Running)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Overwrite status, address and error message. Returns `false` if the
    /// row no longer exists.
    #[instrument(skip(self))]
    pub async fn update_state(
        &self,
        id: &str,
        status: WorkspaceStatus,
        vm_ip: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE workspaces SET status = ?, vm_ip = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(vm_ip)
        .bind(error_message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Delete the row; its ports go with it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    pub async fn insert_port(
        &self,
        workspace_id: &str,
        port: u16,
        label: Option<&str>,
    ) -> Result<Port> {
        let now = Utc::now().timestamp();
        sqlx::query(
            "INSERT INTO ports (workspace_id, port, label, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(workspace_id)
        .bind(i64::from(port))
        .bind(label)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OrchestratorError::Conflict(format!("port {} is already exposed", port))
            } else {
                e.into()
            }
        })?;

        Ok(Port {
            workspace_id: workspace_id.to_string(),
            port,
            label: label.map(str::to_string),
            created_at: timestamp(now),
        })
    }

    pub async fn list_ports(&self, workspace_id: &str) -> Result<Vec<Port>> {
        let rows = sqlx::query_as::<_, PortRow>(
            "SELECT * FROM ports WHERE workspace_id = ? ORDER BY port",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    pub async fn count_ports(&self, workspace_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM ports WHERE workspace_id = ?")
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn delete_port(&self, workspace_id: &str, port: u16) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ports WHERE workspace_id = ? AND port = ?")
            .bind(workspace_id)
            .bind(i64::from(port))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_ports(&self, workspace_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ports WHERE workspace_id = ?")
            .bind(workspace_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    name: String,
    status: WorkspaceStatus,
    image: String,
    vm_ip: Option<String>,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct PortRow {
    workspace_id: String,
    port: i64,
    label: Option<String>,
    created_at: i64,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            status: row.status,
            image: row.image,
            vm_ip: row.vm_ip,
            error_message: row.error_message,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

impl From<PortRow> for Port {
    fn from(row: PortRow) -> Self {
        Self {
            workspace_id: row.workspace_id,
            // The column is constrained to 1..=65535.
            port: u16::try_from(row.port).unwrap_or_default(),
            label: row.label,
            created_at: timestamp(row.created_at),
        }
    }
}
