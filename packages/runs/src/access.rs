// ABOUTME: Workspace authorization checks for run launching and analytics
// ABOUTME: Trait over role lookups with a membership-table implementation

use async_trait::async_trait;
use sqlx::SqlitePool;

use sandkeep_storage::{WorkspaceRole, WorkspaceStorage};

use crate::error::Result;

#[async_trait]
pub trait WorkspaceAccess: Send + Sync {
    /// Role of `user_id` in `workspace_id`, or `None` for non-members
    async fn role(&self, workspace_id: &str, user_id: &str) -> Result<Option<WorkspaceRole>>;

    /// Any member may read runs and analytics
    async fn can_view(&self, workspace_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.role(workspace_id, user_id).await?.is_some())
    }

    /// Viewers may not start runs
    async fn can_launch(&self, workspace_id: &str, user_id: &str) -> Result<bool> {
        Ok(self
            .role(workspace_id, user_id)
            .await?
            .is_some_and(|role| role >= WorkspaceRole::Member))
    }
}

pub struct StoredWorkspaceAccess {
    workspaces: WorkspaceStorage,
}

impl StoredWorkspaceAccess {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            workspaces: WorkspaceStorage::new(pool),
        }
    }
}

#[async_trait]
impl WorkspaceAccess for StoredWorkspaceAccess {
    async fn role(&self, workspace_id: &str, user_id: &str) -> Result<Option<WorkspaceRole>> {
        Ok(self.workspaces.member_role(workspace_id, user_id).await?)
    }
}
