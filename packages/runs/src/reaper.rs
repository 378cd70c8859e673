// ABOUTME: Periodic reclamation of idle-running and stuck-booting runs
// ABOUTME: Kills the backing sandbox with a timeout, then cancels the record through the run manager

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use sandkeep_config::ControlPlaneConfig;

use crate::error::{Result, RunError};
use crate::manager::{cutoff_before, RunManager};
use crate::provisioner::{ProvisioningError, SandboxProvisioner};
use crate::types::{ErrorCode, Run, RunFailure, RunPatch, RunStatus, UpdateOptions};

#[derive(Debug, Clone, PartialEq)]
pub struct ReaperConfig {
    pub interval: Duration,
    pub idle_timeout: Duration,
    pub boot_timeout: Duration,
    pub batch_size: usize,
    pub kill_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self::from(&ControlPlaneConfig::default())
    }
}

impl From<&ControlPlaneConfig> for ReaperConfig {
    fn from(config: &ControlPlaneConfig) -> Self {
        Self {
            interval: config.reaper_interval,
            idle_timeout: config.idle_timeout,
            boot_timeout: config.boot_timeout,
            batch_size: config.reaper_batch_size,
            kill_timeout: config.kill_timeout,
        }
    }
}

/// Why a run was picked up by a sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReapOrigin {
    Idle,
    StuckBooting,
}

impl ReapOrigin {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Idle => ErrorCode::IdleTimeout,
            Self::StuckBooting => ErrorCode::BootTimeout,
        }
    }

    fn message(&self, config: &ReaperConfig) -> String {
        match self {
            Self::Idle => format!(
                "Sandbox idle for more than {}s",
                config.idle_timeout.as_secs()
            ),
            Self::StuckBooting => format!(
                "Sandbox did not finish booting within {}s",
                config.boot_timeout.as_secs()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReapResult {
    /// Record moved to `canceled`
    Killed,
    /// Record had already reached a terminal state
    Skipped,
    /// Record update failed
    Errored,
}

struct CandidateOutcome {
    origin: ReapOrigin,
    result: ReapResult,
    kill_failed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OriginCounts {
    pub found: usize,
    pub killed: usize,
    pub skipped: usize,
    pub errored: usize,
    /// Sandbox kills that failed or timed out; the record is canceled regardless
    pub kill_failures: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle: OriginCounts,
    pub stuck_booting: OriginCounts,
}

impl SweepReport {
    pub fn counts(&self, origin: ReapOrigin) -> &OriginCounts {
        match origin {
            ReapOrigin::Idle => &self.idle,
            ReapOrigin::StuckBooting => &self.stuck_booting,
        }
    }

    fn counts_mut(&mut self, origin: ReapOrigin) -> &mut OriginCounts {
        match origin {
            ReapOrigin::Idle => &mut self.idle,
            ReapOrigin::StuckBooting => &mut self.stuck_booting,
        }
    }

    pub fn total_found(&self) -> usize {
        self.idle.found + self.stuck_booting.found
    }

    pub fn total_killed(&self) -> usize {
        self.idle.killed + self.stuck_booting.killed
    }

    fn record(&mut self, outcome: CandidateOutcome) {
        let counts = self.counts_mut(outcome.origin);
        match outcome.result {
            ReapResult::Killed => counts.killed += 1,
            ReapResult::Skipped => counts.skipped += 1,
            ReapResult::Errored => counts.errored += 1,
        }
        if outcome.kill_failed {
            counts.kill_failures += 1;
        }
    }
}

/// Merge both candidate sets by run id; a run found idle keeps that origin
fn merge_candidates(idle: Vec<Run>, stuck: Vec<Run>) -> Vec<(Run, ReapOrigin)> {
    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(idle.len() + stuck.len());

    for (runs, origin) in [(idle, ReapOrigin::Idle), (stuck, ReapOrigin::StuckBooting)] {
        for run in runs {
            if seen.insert(run.id.clone()) {
                merged.push((run, origin));
            }
        }
    }

    merged
}

pub struct Reaper {
    manager: Arc<RunManager>,
    provisioner: Arc<dyn SandboxProvisioner>,
    config: ReaperConfig,
    running: Arc<RwLock<bool>>,
}

impl Reaper {
    pub fn new(
        manager: Arc<RunManager>,
        provisioner: Arc<dyn SandboxProvisioner>,
        config: ReaperConfig,
    ) -> Self {
        Self {
            manager,
            provisioner,
            config,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Run one sweep over idle and stuck-booting runs.
    ///
    /// Individual kill or update failures are counted in the report; only a
    /// failure to query candidates fails the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let (idle, stuck) = tokio::join!(
            self.manager.find_idle(self.config.idle_timeout),
            self.manager.find_stuck_booting(self.config.boot_timeout)
        );
        let candidates = merge_candidates(idle?, stuck?);

        let mut report = SweepReport::default();
        for (_, origin) in &candidates {
            report.counts_mut(*origin).found += 1;
        }

        if candidates.is_empty() {
            debug!("Reaper sweep found nothing to reclaim");
            return Ok(report);
        }

        for batch in candidates.chunks(self.config.batch_size.max(1)) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|(run, origin)| self.reap_candidate(run, *origin)),
            )
            .await;

            for outcome in outcomes {
                report.record(outcome);
            }
        }

        info!(
            "Reaper sweep: idle found={} killed={} skipped={} errored={} kill_failures={}; \
             stuck_booting found={} killed={} skipped={} errored={}",
            report.idle.found,
            report.idle.killed,
            report.idle.skipped,
            report.idle.errored,
            report.idle.kill_failures,
            report.stuck_booting.found,
            report.stuck_booting.killed,
            report.stuck_booting.skipped,
            report.stuck_booting.errored,
        );

        Ok(report)
    }

    /// Re-read the run; a candidate that saw activity or changed status since
    /// the sweep query is left alone.
    async fn still_reapable(&self, candidate: &Run, origin: ReapOrigin) -> bool {
        let run = match self.manager.get(&candidate.id).await {
            Ok(run) => run,
            Err(RunError::NotFound(_)) => return false,
            Err(e) => {
                warn!("Could not re-read run {} before reaping: {}", candidate.id, e);
                return true;
            }
        };

        match origin {
            ReapOrigin::Idle => {
                run.status == RunStatus::Running
                    && run.last_activity_at < cutoff_before(Utc::now(), self.config.idle_timeout)
            }
            ReapOrigin::StuckBooting => run.status == RunStatus::Booting,
        }
    }

    async fn reap_candidate(&self, run: &Run, origin: ReapOrigin) -> CandidateOutcome {
        if !self.still_reapable(run, origin).await {
            debug!("Run {} is no longer {:?}, leaving it", run.id, origin);
            return CandidateOutcome {
                origin,
                result: ReapResult::Skipped,
                kill_failed: false,
            };
        }

        let mut kill_failed = false;

        if let Some(external_id) = &run.external_id {
            match time::timeout(self.config.kill_timeout, self.kill_sandbox(external_id)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Failed to kill sandbox {} for run {}: {}", external_id, run.id, e);
                    kill_failed = true;
                }
                Err(_) => {
                    warn!(
                        "Killing sandbox {} for run {} timed out after {:?}",
                        external_id, run.id, self.config.kill_timeout
                    );
                    kill_failed = true;
                }
            }
        }

        let patch = RunPatch {
            status: Some(RunStatus::Canceled),
            finished_at: Some(Utc::now()),
            error: Some(RunFailure::new(
                origin.error_code(),
                origin.message(&self.config),
            )),
            ..Default::default()
        };

        let result = match self
            .manager
            .update(&run.id, patch, UpdateOptions::skip_terminal())
            .await
        {
            Ok(outcome) if outcome.skipped => {
                debug!("Run {} finished before it could be reaped", run.id);
                ReapResult::Skipped
            }
            Ok(_) => {
                info!("Reaped run {} ({:?})", run.id, origin);
                ReapResult::Killed
            }
            Err(e) => {
                warn!("Failed to cancel run {}: {}", run.id, e);
                ReapResult::Errored
            }
        };

        CandidateOutcome {
            origin,
            result,
            kill_failed,
        }
    }

    /// Connect and kill; a sandbox that no longer exists counts as killed
    async fn kill_sandbox(&self, external_id: &str) -> std::result::Result<(), ProvisioningError> {
        let handle = match self.provisioner.connect(external_id).await {
            Ok(handle) => handle,
            Err(e) if e.is_gone() => return Ok(()),
            Err(e) => return Err(e),
        };

        match self.provisioner.kill(&handle).await {
            Err(e) if e.is_gone() => Ok(()),
            other => other,
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Start sweeping every `interval`. Returns `None` if already started.
    pub async fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut running = self.running.write().await;
        if *running {
            return None;
        }
        *running = true;
        drop(running);

        let reaper = Arc::clone(self);
        Some(tokio::spawn(async move {
            info!(
                "Reaper started (interval {:?}, idle timeout {:?}, boot timeout {:?})",
                reaper.config.interval, reaper.config.idle_timeout, reaper.config.boot_timeout
            );

            let mut ticker = time::interval(reaper.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if !*reaper.running.read().await {
                    info!("Reaper stopped");
                    break;
                }

                if let Err(e) = reaper.sweep().await {
                    error!("Reaper sweep failed: {}", e);
                }
            }
        }))
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }
}
