// ABOUTME: Cost, trend and error analytics over a workspace's runs in a time window
// ABOUTME: Authorization is checked before loading; aggregation itself is pure over the loaded runs

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::access::WorkspaceAccess;
use crate::error::Result;
use crate::storage::RunStorage;
use crate::types::{ErrorCode, Run, RunStatus};

pub const DEFAULT_TREND_BUCKET: Duration = Duration::from_secs(24 * 60 * 60);

/// Half-open window `[start, end)` over `started_at`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The last `days` days up to now; the start saturates at the earliest representable instant
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now();
        let start = ChronoDuration::try_days(days)
            .and_then(|span| end.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self { start, end }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostAnalytics {
    pub workspace_id: String,
    pub range: TimeRange,
    pub total_runs: u64,
    pub succeeded_runs: u64,
    pub failed_runs: u64,
    pub canceled_runs: u64,
    pub compute_cost: f64,
    pub agent_cost: f64,
    pub total_cost: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cached_tokens: i64,
    /// Mean over runs that recorded a duration
    pub avg_duration_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrendBucket {
    pub bucket_start: DateTime<Utc>,
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub avg_duration_ms: Option<f64>,
    pub total_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorGroup {
    pub code: ErrorCode,
    pub count: u64,
    pub last_seen: DateTime<Utc>,
    pub last_message: String,
}

#[derive(Default)]
struct DurationMean {
    sum: i64,
    n: u64,
}

impl DurationMean {
    fn add(&mut self, duration_ms: Option<i64>) {
        if let Some(ms) = duration_ms {
            self.sum += ms;
            self.n += 1;
        }
    }

    fn mean(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum as f64 / self.n as f64)
    }
}

pub struct AnalyticsAggregator {
    runs: RunStorage,
    access: Arc<dyn WorkspaceAccess>,
}

impl AnalyticsAggregator {
    pub fn new(pool: SqlitePool, access: Arc<dyn WorkspaceAccess>) -> Self {
        Self {
            runs: RunStorage::new(pool),
            access,
        }
    }

    /// Load the window only if `caller` may view the workspace
    async fn authorized_runs(
        &self,
        caller: &str,
        workspace_id: &str,
        range: TimeRange,
    ) -> Result<Option<Vec<Run>>> {
        if !self.access.can_view(workspace_id, caller).await? {
            warn!(
                "Analytics denied for {} on workspace {}",
                caller, workspace_id
            );
            return Ok(None);
        }

        let runs = self
            .runs
            .list_in_window(workspace_id, range.start, range.end)
            .await?;
        Ok(Some(runs))
    }

    pub async fn get_cost_analytics(
        &self,
        caller: &str,
        workspace_id: &str,
        range: TimeRange,
    ) -> Result<Option<CostAnalytics>> {
        let Some(runs) = self.authorized_runs(caller, workspace_id, range).await? else {
            return Ok(None);
        };

        debug!("Summarizing cost of {} runs", runs.len());
        Ok(Some(summarize_costs(workspace_id, range, &runs)))
    }

    pub async fn get_execution_trends(
        &self,
        caller: &str,
        workspace_id: &str,
        range: TimeRange,
        bucket: Option<Duration>,
    ) -> Result<Vec<TrendBucket>> {
        let Some(runs) = self.authorized_runs(caller, workspace_id, range).await? else {
            return Ok(Vec::new());
        };

        Ok(bucket_trends(&runs, bucket.unwrap_or(DEFAULT_TREND_BUCKET)))
    }

    pub async fn get_error_analytics(
        &self,
        caller: &str,
        workspace_id: &str,
        range: TimeRange,
    ) -> Result<Vec<ErrorGroup>> {
        let Some(runs) = self.authorized_runs(caller, workspace_id, range).await? else {
            return Ok(Vec::new());
        };

        Ok(group_errors(&runs))
    }
}

pub fn summarize_costs(workspace_id: &str, range: TimeRange, runs: &[Run]) -> CostAnalytics {
    let mut summary = CostAnalytics {
        workspace_id: workspace_id.to_string(),
        range,
        total_runs: runs.len() as u64,
        succeeded_runs: 0,
        failed_runs: 0,
        canceled_runs: 0,
        compute_cost: 0.0,
        agent_cost: 0.0,
        total_cost: 0.0,
        input_tokens: 0,
        output_tokens: 0,
        cached_tokens: 0,
        avg_duration_ms: None,
    };
    let mut durations = DurationMean::default();

    for run in runs {
        match run.status {
            RunStatus::Succeeded => summary.succeeded_runs += 1,
            RunStatus::Failed => summary.failed_runs += 1,
            RunStatus::Canceled => summary.canceled_runs += 1,
            RunStatus::Booting | RunStatus::Running => {}
        }

        if let Some(cost) = run.cost {
            summary.compute_cost += cost.compute_cost;
            summary.agent_cost += cost.agent_cost;
            summary.total_cost += cost.total_cost;
        }

        if let Some(usage) = run.token_usage {
            summary.input_tokens += usage.input_tokens;
            summary.output_tokens += usage.output_tokens;
            summary.cached_tokens += usage.cached_tokens;
        }

        durations.add(run.duration_ms);
    }

    summary.avg_duration_ms = durations.mean();
    summary
}

/// Sparse fixed-width buckets over `started_at`, aligned to the unix epoch, ascending
pub fn bucket_trends(runs: &[Run], bucket: Duration) -> Vec<TrendBucket> {
    let width_ms = i64::try_from(bucket.as_millis()).unwrap_or(i64::MAX).max(1);

    #[derive(Default)]
    struct Acc {
        runs: u64,
        succeeded: u64,
        failed: u64,
        durations: DurationMean,
        total_cost: f64,
    }

    let mut buckets: BTreeMap<i64, Acc> = BTreeMap::new();
    for run in runs {
        let start_ms = run.started_at.timestamp_millis().div_euclid(width_ms) * width_ms;
        let acc = buckets.entry(start_ms).or_default();

        acc.runs += 1;
        match run.status {
            RunStatus::Succeeded => acc.succeeded += 1,
            RunStatus::Failed => acc.failed += 1,
            _ => {}
        }
        acc.durations.add(run.duration_ms);
        acc.total_cost += run.cost.map(|c| c.total_cost).unwrap_or(0.0);
    }

    buckets
        .into_iter()
        .filter_map(|(start_ms, acc)| {
            Some(TrendBucket {
                bucket_start: DateTime::from_timestamp_millis(start_ms)?,
                runs: acc.runs,
                succeeded: acc.succeeded,
                failed: acc.failed,
                avg_duration_ms: acc.durations.mean(),
                total_cost: acc.total_cost,
            })
        })
        .collect()
}

/// Failed runs grouped by code, most frequent first, ties broken by recency
pub fn group_errors(runs: &[Run]) -> Vec<ErrorGroup> {
    let mut groups: HashMap<ErrorCode, ErrorGroup> = HashMap::new();

    for run in runs.iter().filter(|r| r.status == RunStatus::Failed) {
        let code = run.error.as_ref().map(|e| e.code).unwrap_or(ErrorCode::Unknown);
        let message = run
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_default();
        let seen = run.finished_at.unwrap_or(run.started_at);

        let group = groups.entry(code).or_insert_with(|| ErrorGroup {
            code,
            count: 0,
            last_seen: seen,
            last_message: message.clone(),
        });
        group.count += 1;
        if seen >= group.last_seen {
            group.last_seen = seen;
            group.last_message = message;
        }
    }

    let mut groups: Vec<ErrorGroup> = groups.into_values().collect();
    groups.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| b.last_seen.cmp(&a.last_seen))
    });
    groups
}
