// ABOUTME: Run record type definitions
// ABOUTME: Status and error-code enums, cost/usage values, patches and update outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use sandkeep_storage::StorageError;

/// Longest prompt/result text kept on a run record, in characters
pub const MAX_TEXT_LEN: usize = 4096;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Booting,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        Self::Booting,
        Self::Running,
        Self::Succeeded,
        Self::Failed,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Booting => "booting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self, StorageError> {
        match s {
            "booting" => Ok(Self::Booting),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            _ => Err(StorageError::InvalidValue(format!("unknown run status: {}", s))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category recorded on a run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Timeout,
    QuotaExceeded,
    PermissionDenied,
    ProvisioningFailed,
    AgentError,
    IdleTimeout,
    BootTimeout,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::QuotaExceeded => "quota_exceeded",
            Self::PermissionDenied => "permission_denied",
            Self::ProvisioningFailed => "provisioning_failed",
            Self::AgentError => "agent_error",
            Self::IdleTimeout => "idle_timeout",
            Self::BootTimeout => "boot_timeout",
            Self::Unknown => "unknown",
        }
    }

    /// Lossy parse: anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "timeout" => Self::Timeout,
            "quota_exceeded" => Self::QuotaExceeded,
            "permission_denied" => Self::PermissionDenied,
            "provisioning_failed" => Self::ProvisioningFailed,
            "agent_error" => Self::AgentError,
            "idle_timeout" => Self::IdleTimeout,
            "boot_timeout" => Self::BootTimeout,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunFailure {
    pub message: String,
    pub code: ErrorCode,
    pub details: Option<serde_json::Value>,
}

impl RunFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct RunCost {
    pub compute_cost: f64,
    pub agent_cost: f64,
    pub total_cost: f64,
}

impl RunCost {
    pub fn new(compute_cost: f64, agent_cost: f64) -> Self {
        Self {
            compute_cost,
            agent_cost,
            total_cost: compute_cost + agent_cost,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
}

/// Per-run overrides of the global timeouts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RunLimits {
    pub max_duration_ms: Option<i64>,
    pub idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: String,
    pub workspace_id: String,
    pub thread_id: String,
    pub created_by: String,
    pub external_id: Option<String>,
    pub status: RunStatus,

    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,

    pub limits: RunLimits,

    pub error: Option<RunFailure>,
    pub cost: Option<RunCost>,
    pub token_usage: Option<TokenUsage>,
    pub duration_ms: Option<i64>,

    pub prompt: Option<String>,
    pub result: Option<String>,
    pub trace_id: Option<String>,

    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRunInput {
    pub thread_id: String,
    pub workspace_id: String,
    pub creator_id: String,
    pub limits: RunLimits,
    pub prompt: Option<String>,
    pub trace_id: Option<String>,
}

/// Partial update of a run. `None` fields are left untouched.
///
/// Has no workspace field: a run never changes tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub external_id: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub error: Option<RunFailure>,
    pub cost: Option<RunCost>,
    pub token_usage: Option<TokenUsage>,
    pub duration_ms: Option<i64>,
    pub prompt: Option<String>,
    pub result: Option<String>,
    pub trace_id: Option<String>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Provisioning succeeded: `booting -> running` with the sandbox id
    pub fn running(external_id: impl Into<String>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            external_id: Some(external_id.into()),
            ..Default::default()
        }
    }

    pub fn failed(failure: RunFailure) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error: Some(failure),
            ..Default::default()
        }
    }

    pub fn activity(at: DateTime<Utc>) -> Self {
        Self {
            last_activity_at: Some(at),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Report a terminal run as skipped instead of failing the transition
    pub skip_terminal_states: bool,
}

impl UpdateOptions {
    pub fn skip_terminal() -> Self {
        Self {
            skip_terminal_states: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub updated: bool,
    pub skipped: bool,
    pub reason: Option<String>,
}

impl UpdateOutcome {
    pub fn updated() -> Self {
        Self {
            updated: true,
            skipped: false,
            reason: None,
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            updated: false,
            skipped: true,
            reason: Some(reason.into()),
        }
    }
}

/// Cut `text` down to `MAX_TEXT_LEN` characters
pub fn truncate_text(text: &str) -> String {
    match text.char_indices().nth(MAX_TEXT_LEN) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
