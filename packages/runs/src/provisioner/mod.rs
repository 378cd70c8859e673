// ABOUTME: Provisioner trait for the external sandbox runtime
// ABOUTME: Create/connect/kill interface plus categorized provisioning errors

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ErrorCode, RunLimits};

pub mod e2b;

pub use e2b::E2bProvisioner;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProvisioningError {
    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Provisioning timed out: {0}")]
    Timeout(String),

    #[error("Provisioning quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Provisioning permission denied: {0}")]
    PermissionDenied(String),

    #[error("Provisioning error: {0}")]
    Other(String),
}

impl ProvisioningError {
    /// Categorize a free-form failure message from the runtime
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("not found") || lower.contains("does not exist") {
            Self::NotFound(message)
        } else if lower.contains("timeout") || lower.contains("timed out") {
            Self::Timeout(message)
        } else if lower.contains("quota")
            || lower.contains("rate limit")
            || lower.contains("limit exceeded")
            || lower.contains("too many")
        {
            Self::QuotaExceeded(message)
        } else if lower.contains("permission")
            || lower.contains("unauthorized")
            || lower.contains("forbidden")
            || lower.contains("api key")
        {
            Self::PermissionDenied(message)
        } else {
            Self::Other(message)
        }
    }

    /// The sandbox is already gone; for kills this counts as success
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::NotFound(_) | Self::Other(_) => ErrorCode::ProvisioningFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProvisioningError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedSandbox {
    pub external_id: String,
}

/// Live connection to a sandbox, needed to kill it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub external_id: String,
}

/// External sandbox runtime.
///
/// `kill` must be idempotent: killing an already dead sandbox is `Ok(())`.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Create a sandbox from a template
    async fn create(&self, template_id: &str, limits: &RunLimits) -> Result<ProvisionedSandbox>;

    /// Attach to an existing sandbox
    async fn connect(&self, external_id: &str) -> Result<SandboxHandle>;

    /// Terminate the sandbox behind `handle`
    async fn kill(&self, handle: &SandboxHandle) -> Result<()>;
}
