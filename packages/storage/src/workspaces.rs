// ABOUTME: Workspace (tenant) and membership storage
// ABOUTME: Existence checks for run creation and role lookups for authorization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::{from_millis, now_millis, Result, StorageError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceRole {
    Viewer,
    Member,
    Admin,
    Owner,
}

impl WorkspaceRole {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Viewer => "viewer",
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            _ => Err(StorageError::InvalidValue(format!("unknown role: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceMember {
    pub workspace_id: String,
    pub user_id: String,
    pub role: WorkspaceRole,
    pub created_at: DateTime<Utc>,
}

pub struct WorkspaceStorage {
    pool: SqlitePool,
}

impl WorkspaceStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_workspace(&self, id: &str, name: &str) -> Result<Workspace> {
        let now = now_millis();

        sqlx::query("INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)")
            .bind(id)
            .bind(name)
            .bind(now)
            .execute(&self.pool)
            .await?;

        debug!("Created workspace: {}", id);

        Ok(Workspace {
            id: id.to_string(),
            name: name.to_string(),
            created_at: from_millis(now)?,
        })
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query("SELECT id, name, created_at FROM workspaces WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Workspace {
                id: row.get("id"),
                name: row.get("name"),
                created_at: from_millis(row.get("created_at"))?,
            }),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    pub async fn workspace_exists(&self, id: &str) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM workspaces WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Delete a workspace; members and runs go with it via ON DELETE CASCADE
    pub async fn delete_workspace(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Add a member or change the role of an existing one
    pub async fn upsert_member(
        &self,
        workspace_id: &str,
        user_id: &str,
        role: WorkspaceRole,
    ) -> Result<WorkspaceMember> {
        let now = now_millis();

        sqlx::query(
            r#"
            INSERT INTO workspace_members (workspace_id, user_id, role, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (workspace_id, user_id) DO UPDATE SET role = excluded.role
            "#,
        )
        .bind(workspace_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(WorkspaceMember {
            workspace_id: workspace_id.to_string(),
            user_id: user_id.to_string(),
            role,
            created_at: from_millis(now)?,
        })
    }

    pub async fn remove_member(&self, workspace_id: &str, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workspace_members WHERE workspace_id = ?1 AND user_id = ?2")
            .bind(workspace_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn member_role(
        &self,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Option<WorkspaceRole>> {
        let role: Option<String> = sqlx::query_scalar(
            "SELECT role FROM workspace_members WHERE workspace_id = ?1 AND user_id = ?2",
        )
        .bind(workspace_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        role.as_deref().map(WorkspaceRole::from_str).transpose()
    }

    pub async fn list_members(&self, workspace_id: &str) -> Result<Vec<WorkspaceMember>> {
        let rows = sqlx::query(
            r#"
            SELECT workspace_id, user_id, role, created_at
            FROM workspace_members
            WHERE workspace_id = ?1
            ORDER BY user_id
            "#,
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(WorkspaceMember {
                    workspace_id: row.get("workspace_id"),
                    user_id: row.get("user_id"),
                    role: WorkspaceRole::from_str(&row.get::<String, _>("role"))?,
                    created_at: from_millis(row.get("created_at"))?,
                })
            })
            .collect()
    }
}
