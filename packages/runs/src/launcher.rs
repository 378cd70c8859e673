// ABOUTME: Create-path orchestration for new runs
// ABOUTME: Authorizes, rate limits, records the run, provisions its sandbox and records the outcome

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

use crate::access::WorkspaceAccess;
use crate::error::{Result, RunError};
use crate::manager::RunManager;
use crate::provisioner::{ProvisioningError, SandboxHandle, SandboxProvisioner};
use crate::rate_limit::RateLimiter;
use crate::types::{CreateRunInput, Run, RunFailure, RunLimits, RunPatch, UpdateOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub workspace_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub template_id: String,
    pub limits: RunLimits,
    pub prompt: Option<String>,
    pub trace_id: Option<String>,
}

pub struct RunLauncher {
    manager: Arc<RunManager>,
    provisioner: Arc<dyn SandboxProvisioner>,
    access: Arc<dyn WorkspaceAccess>,
    rate_limiter: Arc<RateLimiter>,
    boot_timeout: Duration,
}

impl RunLauncher {
    pub fn new(
        manager: Arc<RunManager>,
        provisioner: Arc<dyn SandboxProvisioner>,
        access: Arc<dyn WorkspaceAccess>,
        rate_limiter: Arc<RateLimiter>,
        boot_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            provisioner,
            access,
            rate_limiter,
            boot_timeout,
        }
    }

    /// Start a run and its sandbox.
    ///
    /// Nothing is written when authorization or rate limiting rejects the
    /// request. If provisioning fails, the run is marked failed before the
    /// error is returned.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Run> {
        if !self
            .access
            .can_launch(&request.workspace_id, &request.user_id)
            .await?
        {
            return Err(RunError::Unauthorized {
                workspace_id: request.workspace_id,
                user_id: request.user_id,
            });
        }

        self.rate_limiter.check(&request.user_id).await?;

        let run = self
            .manager
            .create_run(CreateRunInput {
                thread_id: request.thread_id,
                workspace_id: request.workspace_id,
                creator_id: request.user_id,
                limits: request.limits,
                prompt: request.prompt,
                trace_id: request.trace_id,
            })
            .await?;

        let provisioned = match time::timeout(
            self.boot_timeout,
            self.provisioner.create(&request.template_id, &request.limits),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProvisioningError::Timeout(format!(
                "Sandbox creation exceeded {}s",
                self.boot_timeout.as_secs()
            ))),
        };

        let sandbox = match provisioned {
            Ok(sandbox) => sandbox,
            Err(e) => return Err(self.fail_run(&run.id, e).await),
        };

        if let Err(e) = self
            .manager
            .update(
                &run.id,
                RunPatch::running(sandbox.external_id.clone()),
                UpdateOptions::default(),
            )
            .await
        {
            warn!(
                "Run {} could not move to running, releasing sandbox {}",
                run.id, sandbox.external_id
            );
            let handle = SandboxHandle {
                external_id: sandbox.external_id,
            };
            if let Err(kill_err) = self.provisioner.kill(&handle).await {
                error!("Failed to release sandbox {}: {}", handle.external_id, kill_err);
            }
            return Err(e);
        }

        info!(
            "Run {} is running on sandbox {}",
            run.id, sandbox.external_id
        );
        self.manager.get(&run.id).await
    }

    async fn fail_run(&self, run_id: &str, err: ProvisioningError) -> RunError {
        warn!("Provisioning failed for run {}: {}", run_id, err);

        let failure = RunFailure::new(err.code(), err.to_string());
        if let Err(update_err) = self
            .manager
            .update(run_id, RunPatch::failed(failure), UpdateOptions::skip_terminal())
            .await
        {
            error!("Failed to mark run {} as failed: {}", run_id, update_err);
        }

        RunError::Provisioning(err)
    }
}
