// ABOUTME: Sandbox run lifecycle tracking for Sandkeep
// ABOUTME: State machine, race-safe run updates, reaper, rate limiting, analytics and provisioning

pub mod access;
pub mod analytics;
pub mod error;
pub mod heartbeat;
pub mod launcher;
pub mod manager;
pub mod provisioner;
pub mod rate_limit;
pub mod reaper;
pub mod state_machine;
pub mod storage;
pub mod types;

pub use access::{StoredWorkspaceAccess, WorkspaceAccess};
pub use analytics::{AnalyticsAggregator, CostAnalytics, ErrorGroup, TimeRange, TrendBucket};
pub use error::{Result, RunError};
pub use heartbeat::Heartbeat;
pub use launcher::{LaunchRequest, RunLauncher};
pub use manager::{RunManager, MAX_CAS_ATTEMPTS};
pub use provisioner::{
    E2bProvisioner, ProvisionedSandbox, ProvisioningError, SandboxHandle, SandboxProvisioner,
};
pub use rate_limit::RateLimiter;
pub use reaper::{OriginCounts, ReapOrigin, Reaper, ReaperConfig, SweepReport};
pub use state_machine::{allowed_transitions, can_transition, transition_error};
pub use storage::RunStorage;
pub use types::{
    CreateRunInput, ErrorCode, Run, RunCost, RunFailure, RunLimits, RunPatch, RunStatus,
    TokenUsage, UpdateOptions, UpdateOutcome, MAX_TEXT_LEN,
};

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use sqlx::SqlitePool;
    use std::sync::Mutex;
    use std::time::Duration;

    use sandkeep_storage::{from_millis, now_millis, open_in_memory, WorkspaceStorage};

    use crate::provisioner::{
        ProvisionedSandbox, ProvisioningError, SandboxHandle, SandboxProvisioner,
    };
    use crate::types::{Run, RunLimits, RunStatus};

    /// In-memory database with workspaces `ws-1` and `ws-2`
    pub async fn setup_pool() -> SqlitePool {
        let pool = open_in_memory().await.unwrap();
        let workspaces = WorkspaceStorage::new(pool.clone());
        workspaces.create_workspace("ws-1", "Workspace One").await.unwrap();
        workspaces.create_workspace("ws-2", "Workspace Two").await.unwrap();
        pool
    }

    /// A booting run stamped now, at storage precision
    pub fn new_run(id: &str, workspace_id: &str, creator: &str) -> Run {
        let now = from_millis(now_millis()).unwrap();
        Run {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            thread_id: "thread-1".to_string(),
            created_by: creator.to_string(),
            external_id: None,
            status: RunStatus::Booting,
            started_at: now,
            finished_at: None,
            last_activity_at: now,
            limits: RunLimits::default(),
            error: None,
            cost: None,
            token_usage: None,
            duration_ms: None,
            prompt: None,
            result: None,
            trace_id: None,
            version: 0,
        }
    }

    /// Push a timestamp column of a run `ago` into the past, bypassing the manager
    pub async fn backdate(pool: &SqlitePool, run_id: &str, column: &str, ago: Duration) {
        sqlx::query(&format!("UPDATE runs SET {} = ?1 WHERE id = ?2", column))
            .bind(now_millis() - ago.as_millis() as i64)
            .bind(run_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[derive(Default)]
    pub struct MockProvisioner {
        created: Mutex<u32>,
        killed: Mutex<Vec<String>>,
        create_error: Option<ProvisioningError>,
        connect_error: Option<ProvisioningError>,
        kill_error: Option<ProvisioningError>,
        create_delay: Option<Duration>,
        kill_delay: Option<Duration>,
    }

    impl MockProvisioner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing_create(mut self, err: ProvisioningError) -> Self {
            self.create_error = Some(err);
            self
        }

        pub fn failing_connect(mut self, err: ProvisioningError) -> Self {
            self.connect_error = Some(err);
            self
        }

        pub fn failing_kill(mut self, err: ProvisioningError) -> Self {
            self.kill_error = Some(err);
            self
        }

        pub fn slow_create(mut self, delay: Duration) -> Self {
            self.create_delay = Some(delay);
            self
        }

        pub fn slow_kill(mut self, delay: Duration) -> Self {
            self.kill_delay = Some(delay);
            self
        }

        pub fn killed(&self) -> Vec<String> {
            let mut killed = self.killed.lock().unwrap().clone();
            killed.sort();
            killed
        }
    }

    #[async_trait]
    impl SandboxProvisioner for MockProvisioner {
        async fn create(
            &self,
            _template_id: &str,
            _limits: &RunLimits,
        ) -> Result<ProvisionedSandbox, ProvisioningError> {
            if let Some(delay) = self.create_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = &self.create_error {
                return Err(err.clone());
            }
            let n = {
                let mut created = self.created.lock().unwrap();
                *created += 1;
                *created
            };
            Ok(ProvisionedSandbox {
                external_id: format!("sbx-mock-{}", n),
            })
        }

        async fn connect(&self, external_id: &str) -> Result<SandboxHandle, ProvisioningError> {
            if let Some(err) = &self.connect_error {
                return Err(err.clone());
            }
            Ok(SandboxHandle {
                external_id: external_id.to_string(),
            })
        }

        async fn kill(&self, handle: &SandboxHandle) -> Result<(), ProvisioningError> {
            if let Some(delay) = self.kill_delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = &self.kill_error {
                return Err(err.clone());
            }
            self.killed
                .lock()
                .unwrap()
                .push(handle.external_id.clone());
            Ok(())
        }
    }
}
