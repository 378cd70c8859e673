// ABOUTME: Run record manager, the single write path for run records
// ABOUTME: Validates transitions and patch invariants, then persists with a version check and retries on lost races

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sandkeep_storage::{from_millis, now_millis, StorageError, WorkspaceStorage};

use crate::error::{Result, RunError};
use crate::state_machine::{can_transition, transition_error};
use crate::storage::RunStorage;
use crate::types::{
    truncate_text, CreateRunInput, Run, RunLimits, RunPatch, RunStatus, UpdateOptions,
    UpdateOutcome,
};

/// How many times an update re-reads and retries after losing a version race
pub const MAX_CAS_ATTEMPTS: usize = 8;

const ALREADY_TERMINAL: &str = "already terminal";

enum Plan {
    Skip(String),
    Apply(RunPatch),
}

pub struct RunManager {
    runs: RunStorage,
    workspaces: WorkspaceStorage,
}

impl RunManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            runs: RunStorage::new(pool.clone()),
            workspaces: WorkspaceStorage::new(pool),
        }
    }

    pub fn storage(&self) -> &RunStorage {
        &self.runs
    }

    /// Record a new run in `booting` and return its id
    pub async fn create(
        &self,
        thread_id: &str,
        workspace_id: &str,
        creator_id: &str,
        limits: RunLimits,
    ) -> Result<String> {
        let run = self
            .create_run(CreateRunInput {
                thread_id: thread_id.to_string(),
                workspace_id: workspace_id.to_string(),
                creator_id: creator_id.to_string(),
                limits,
                prompt: None,
                trace_id: None,
            })
            .await?;

        Ok(run.id)
    }

    pub async fn create_run(&self, input: CreateRunInput) -> Result<Run> {
        if !self.workspaces.workspace_exists(&input.workspace_id).await? {
            return Err(RunError::WorkspaceNotFound(input.workspace_id));
        }

        let now = from_millis(now_millis())?;
        let run = Run {
            id: format!("run_{}", Uuid::new_v4().simple()),
            workspace_id: input.workspace_id,
            thread_id: input.thread_id,
            created_by: input.creator_id,
            external_id: None,
            status: RunStatus::Booting,
            started_at: now,
            finished_at: None,
            last_activity_at: now,
            limits: input.limits,
            error: None,
            cost: None,
            token_usage: None,
            duration_ms: None,
            prompt: input.prompt.as_deref().map(truncate_text),
            result: None,
            trace_id: input.trace_id,
            version: 0,
        };

        self.runs.insert_run(&run).await?;

        info!(
            "Created run {} for thread {} in workspace {} by {}",
            run.id, run.thread_id, run.workspace_id, run.created_by
        );

        Ok(run)
    }

    pub async fn get(&self, run_id: &str) -> Result<Run> {
        match self.runs.get_run(run_id).await {
            Ok(run) => Ok(run),
            Err(StorageError::NotFound(_)) => Err(RunError::NotFound(run_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply `patch` to the current state of the run.
    ///
    /// The record is re-read on every attempt, so validation always runs
    /// against what is actually stored. A write that loses the version race is
    /// retried from the re-read, up to `MAX_CAS_ATTEMPTS` times.
    pub async fn update(
        &self,
        run_id: &str,
        patch: RunPatch,
        options: UpdateOptions,
    ) -> Result<UpdateOutcome> {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.get(run_id).await?;

            let effective = match plan_update(&current, &patch, options, Utc::now())? {
                Plan::Skip(reason) => {
                    debug!("Skipped update of run {}: {}", run_id, reason);
                    return Ok(UpdateOutcome::skipped(reason));
                }
                Plan::Apply(effective) => effective,
            };

            if effective.is_empty() {
                return Ok(UpdateOutcome::updated());
            }

            if self
                .runs
                .update_run_if_version(run_id, current.version, &effective)
                .await?
            {
                if let Some(status) = effective.status {
                    info!("Run {} moved {} -> {}", run_id, current.status, status);
                }
                return Ok(UpdateOutcome::updated());
            }

            debug!(
                "Run {} changed during update (attempt {}/{}), retrying",
                run_id, attempt, MAX_CAS_ATTEMPTS
            );
        }

        warn!(
            "Giving up on run {} after {} concurrent modifications",
            run_id, MAX_CAS_ATTEMPTS
        );
        Err(RunError::Conflict(run_id.to_string()))
    }

    /// Record activity now
    pub async fn heartbeat(&self, run_id: &str) -> Result<UpdateOutcome> {
        self.update(run_id, RunPatch::activity(Utc::now()), UpdateOptions::default())
            .await
    }

    /// Running runs with a sandbox whose last activity is older than `max_idle`
    pub async fn find_idle(&self, max_idle: Duration) -> Result<Vec<Run>> {
        let runs = self
            .runs
            .find_idle_running(cutoff_before(Utc::now(), max_idle))
            .await?;
        Ok(runs)
    }

    /// Runs still booting after `max_boot`
    pub async fn find_stuck_booting(&self, max_boot: Duration) -> Result<Vec<Run>> {
        let runs = self
            .runs
            .find_stuck_booting(cutoff_before(Utc::now(), max_boot))
            .await?;
        Ok(runs)
    }

    pub async fn list_for_thread(&self, thread_id: &str) -> Result<Vec<Run>> {
        Ok(self.runs.list_for_thread(thread_id).await?)
    }
}

/// `now - age`, saturating at the earliest representable instant
pub(crate) fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Work out what actually gets written for `patch` given the stored `current`
fn plan_update(
    current: &Run,
    patch: &RunPatch,
    options: UpdateOptions,
    now: DateTime<Utc>,
) -> Result<Plan> {
    let mut effective = patch.clone();

    if current.status.is_terminal() && options.skip_terminal_states && patch.status.is_some() {
        return Ok(Plan::Skip(ALREADY_TERMINAL.to_string()));
    }

    let status_change = match patch.status {
        Some(to) if to != current.status => {
            if !can_transition(current.status, to) {
                return Err(RunError::InvalidTransition {
                    from: current.status,
                    to,
                    message: transition_error(current.status, to),
                });
            }
            Some(to)
        }
        _ => None,
    };
    effective.status = status_change;

    let resulting = status_change.unwrap_or(current.status);

    let attaches_sandbox = current.status == RunStatus::Running
        || (current.status == RunStatus::Booting && resulting == RunStatus::Running);
    if patch.external_id.is_some() && !attaches_sandbox {
        return Err(RunError::InvalidPatch(format!(
            "external_id can only be set on booting -> running or a running run, run is '{}'",
            current.status
        )));
    }

    if patch.finished_at.is_some() && !resulting.is_terminal() {
        return Err(RunError::InvalidPatch(format!(
            "finished_at requires a terminal status, run would be '{}'",
            resulting
        )));
    }

    if current.finished_at.is_some() {
        effective.finished_at = None;
    } else if resulting.is_terminal() && effective.finished_at.is_none() {
        effective.finished_at = Some(now);
    }

    let activity = match (patch.last_activity_at, status_change) {
        (Some(at), Some(_)) => Some(at.max(now)),
        (Some(at), None) => Some(at),
        (None, Some(_)) => Some(now),
        (None, None) => None,
    };
    effective.last_activity_at = activity.filter(|at| *at > current.last_activity_at);

    effective.prompt = patch.prompt.as_deref().map(truncate_text);
    effective.result = patch.result.as_deref().map(truncate_text);

    Ok(Plan::Apply(effective))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{backdate, setup_pool};
    use crate::types::{ErrorCode, RunCost, RunFailure, MAX_TEXT_LEN};
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::sync::Arc;

    async fn setup() -> (RunManager, SqlitePool) {
        let pool = setup_pool().await;
        (RunManager::new(pool.clone()), pool)
    }

    async fn running_run(manager: &RunManager) -> String {
        let id = manager
            .create("thread-1", "ws-1", "alice", RunLimits::default())
            .await
            .unwrap();
        manager
            .update(&id, RunPatch::running("sbx-1"), UpdateOptions::default())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_starts_booting() {
        let (manager, _) = setup().await;
        let id = manager
            .create("thread-1", "ws-1", "alice", RunLimits::default())
            .await
            .unwrap();

        let run = manager.get(&id).await.unwrap();
        assert!(run.id.starts_with("run_"));
        assert_eq!(run.status, RunStatus::Booting);
        assert_eq!(run.started_at, run.last_activity_at);
        assert_eq!(run.external_id, None);
        assert_eq!(run.finished_at, None);
    }

    #[tokio::test]
    async fn test_create_in_unknown_workspace() {
        let (manager, _) = setup().await;
        let result = manager
            .create("thread-1", "nope", "alice", RunLimits::default())
            .await;
        assert!(matches!(result, Err(RunError::WorkspaceNotFound(ws)) if ws == "nope"));
    }

    #[tokio::test]
    async fn test_create_truncates_prompt() {
        let (manager, _) = setup().await;
        let run = manager
            .create_run(CreateRunInput {
                thread_id: "thread-1".to_string(),
                workspace_id: "ws-1".to_string(),
                creator_id: "alice".to_string(),
                limits: RunLimits::default(),
                prompt: Some("x".repeat(MAX_TEXT_LEN * 2)),
                trace_id: None,
            })
            .await
            .unwrap();

        assert_eq!(run.prompt.map(|p| p.len()), Some(MAX_TEXT_LEN));
    }

    #[tokio::test]
    async fn test_update_missing_run() {
        let (manager, _) = setup().await;
        let result = manager
            .update("missing", RunPatch::status(RunStatus::Running), UpdateOptions::default())
            .await;
        assert!(matches!(result, Err(RunError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_running_with_external_id() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;

        let run = manager.get(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.external_id.as_deref(), Some("sbx-1"));
        assert_eq!(run.version, 1);
    }

    #[tokio::test]
    async fn test_external_id_rejected_while_booting() {
        let (manager, _) = setup().await;
        let id = manager
            .create("thread-1", "ws-1", "alice", RunLimits::default())
            .await
            .unwrap();

        let patch = RunPatch {
            external_id: Some("sbx-1".to_string()),
            ..Default::default()
        };
        let result = manager.update(&id, patch, UpdateOptions::default()).await;
        assert!(matches!(result, Err(RunError::InvalidPatch(_))));
        assert_eq!(manager.get(&id).await.unwrap().external_id, None);
    }

    #[rstest]
    #[case::canceled(RunStatus::Canceled)]
    #[case::failed(RunStatus::Failed)]
    #[tokio::test]
    async fn test_external_id_rejected_when_booting_skips_running(#[case] to: RunStatus) {
        let (manager, _) = setup().await;
        let id = manager
            .create("thread-1", "ws-1", "alice", RunLimits::default())
            .await
            .unwrap();

        let patch = RunPatch {
            status: Some(to),
            external_id: Some("sbx-1".to_string()),
            ..Default::default()
        };
        let result = manager.update(&id, patch, UpdateOptions::default()).await;
        assert!(matches!(result, Err(RunError::InvalidPatch(_))));

        let run = manager.get(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Booting);
        assert_eq!(run.external_id, None);
    }

    #[tokio::test]
    async fn test_external_id_rejected_on_terminal_run() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;
        manager
            .update(&id, RunPatch::status(RunStatus::Canceled), UpdateOptions::default())
            .await
            .unwrap();

        let patch = RunPatch {
            external_id: Some("sbx-2".to_string()),
            ..Default::default()
        };
        let result = manager.update(&id, patch, UpdateOptions::default()).await;
        assert!(matches!(result, Err(RunError::InvalidPatch(_))));
        assert_eq!(manager.get(&id).await.unwrap().external_id.as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_terminal_transition_stamps_finished_at() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;

        manager
            .update(&id, RunPatch::status(RunStatus::Succeeded), UpdateOptions::default())
            .await
            .unwrap();

        let run = manager.get(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finished_at_rejected_on_non_terminal() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;

        let patch = RunPatch {
            finished_at: Some(Utc::now()),
            ..Default::default()
        };
        let result = manager.update(&id, patch, UpdateOptions::default()).await;
        assert!(matches!(result, Err(RunError::InvalidPatch(_))));
    }

    #[tokio::test]
    async fn test_finished_at_is_write_once() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;

        manager
            .update(&id, RunPatch::status(RunStatus::Failed), UpdateOptions::default())
            .await
            .unwrap();
        let first = manager.get(&id).await.unwrap().finished_at;

        let later = RunPatch {
            finished_at: Some(Utc::now() + chrono::Duration::hours(1)),
            cost: Some(RunCost::new(0.5, 0.25)),
            ..Default::default()
        };
        let outcome = manager.update(&id, later, UpdateOptions::default()).await.unwrap();
        assert!(outcome.updated);

        let run = manager.get(&id).await.unwrap();
        assert_eq!(run.finished_at, first);
        assert_eq!(run.cost, Some(RunCost::new(0.5, 0.25)));
    }

    #[tokio::test]
    async fn test_terminal_transition_rejected_without_skip() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;
        manager
            .update(&id, RunPatch::status(RunStatus::Succeeded), UpdateOptions::default())
            .await
            .unwrap();

        let err = manager
            .update(&id, RunPatch::status(RunStatus::Running), UpdateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot transition from terminal state 'succeeded'"
        );
    }

    #[tokio::test]
    async fn test_terminal_skipped_with_option() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;
        manager
            .update(&id, RunPatch::status(RunStatus::Succeeded), UpdateOptions::default())
            .await
            .unwrap();
        let before = manager.get(&id).await.unwrap();

        let outcome = manager
            .update(
                &id,
                RunPatch::failed(RunFailure::new(ErrorCode::IdleTimeout, "idle")),
                UpdateOptions::skip_terminal(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, UpdateOutcome::skipped("already terminal"));
        assert_eq!(manager.get(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_same_status_is_noop() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;

        let outcome = manager
            .update(&id, RunPatch::status(RunStatus::Running), UpdateOptions::default())
            .await
            .unwrap();
        assert!(outcome.updated);
        assert_eq!(manager.get(&id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_last_activity_never_moves_backwards() {
        let (manager, _) = setup().await;
        let id = running_run(&manager).await;
        let before = manager.get(&id).await.unwrap().last_activity_at;

        manager
            .update(
                &id,
                RunPatch::activity(before - chrono::Duration::minutes(5)),
                UpdateOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(manager.get(&id).await.unwrap().last_activity_at, before);
    }

    #[tokio::test]
    async fn test_heartbeat_moves_activity_forward() {
        let (manager, pool) = setup().await;
        let id = running_run(&manager).await;
        backdate(&pool, &id, "last_activity_at", Duration::from_secs(600)).await;
        let stale = manager.get(&id).await.unwrap().last_activity_at;

        manager.heartbeat(&id).await.unwrap();

        assert!(manager.get(&id).await.unwrap().last_activity_at > stale);
    }

    #[tokio::test]
    async fn test_concurrent_terminal_writers_one_wins() {
        let (manager, _) = setup().await;
        let manager = Arc::new(manager);
        let id = running_run(&manager).await;

        let succeed = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .update(&id, RunPatch::status(RunStatus::Succeeded), UpdateOptions::default())
                    .await
            })
        };
        let fail = {
            let manager = manager.clone();
            let id = id.clone();
            tokio::spawn(async move {
                manager
                    .update(
                        &id,
                        RunPatch::failed(RunFailure::new(ErrorCode::AgentError, "crashed")),
                        UpdateOptions::default(),
                    )
                    .await
            })
        };

        let results = [succeed.await.unwrap(), fail.await.unwrap()];
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(RunError::InvalidTransition { .. }))));

        let run = manager.get(&id).await.unwrap();
        assert!(run.status.is_terminal());
        assert_eq!(run.version, 2);
    }

    #[tokio::test]
    async fn test_find_idle_and_stuck_booting() {
        let (manager, pool) = setup().await;
        let idle = running_run(&manager).await;
        let fresh = running_run(&manager).await;
        let booting = manager
            .create("thread-2", "ws-1", "alice", RunLimits::default())
            .await
            .unwrap();

        backdate(&pool, &idle, "last_activity_at", Duration::from_secs(3600)).await;
        backdate(&pool, &booting, "started_at", Duration::from_secs(3600)).await;

        let idle_ids: Vec<_> = manager
            .find_idle(Duration::from_secs(600))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(idle_ids, vec![idle]);
        assert!(!idle_ids.contains(&fresh));

        let stuck_ids: Vec<_> = manager
            .find_stuck_booting(Duration::from_secs(120))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(stuck_ids, vec![booting]);
    }

    #[test]
    fn test_cutoff_saturates() {
        let now = Utc::now();
        assert_eq!(
            cutoff_before(now, Duration::from_secs(60)),
            now - chrono::Duration::seconds(60)
        );
        assert_eq!(
            cutoff_before(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MIN_UTC
        );
    }
}
