// ABOUTME: Error taxonomy for run lifecycle operations
// ABOUTME: Policy errors surface directly; storage and provisioning errors are wrapped

use sandkeep_storage::StorageError;
use thiserror::Error;

use crate::provisioner::ProvisioningError;
use crate::types::RunStatus;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("{message}")]
    InvalidTransition {
        from: RunStatus,
        to: RunStatus,
        message: String,
    },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),

    #[error("User {user_id} is not authorized for workspace {workspace_id}")]
    Unauthorized {
        workspace_id: String,
        user_id: String,
    },

    #[error("Rate limit exceeded for {user_id}: at most {limit} runs per {window_secs}s")]
    RateLimited {
        user_id: String,
        limit: u32,
        window_secs: u64,
    },

    #[error("Provisioning failed: {0}")]
    Provisioning(#[from] ProvisioningError),

    #[error("Run {0} kept changing under concurrent writers")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<sqlx::Error> for RunError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

pub type Result<T> = std::result::Result<T, RunError>;
