// ABOUTME: Storage layer for run records in SQLite
// ABOUTME: Inserts, version-guarded partial updates and the indexed scans used by reaper, limiter and analytics

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use sandkeep_storage::{from_millis, Result, StorageError};

use crate::types::{ErrorCode, Run, RunCost, RunFailure, RunLimits, RunPatch, RunStatus, TokenUsage};

const RUN_COLUMNS: &str = r#"
    id, workspace_id, thread_id, created_by, external_id, status,
    started_at, finished_at, last_activity_at,
    max_duration_ms, idle_timeout_ms,
    error_message, error_code, error_details,
    compute_cost, agent_cost, total_cost,
    input_tokens, output_tokens, cached_tokens, duration_ms,
    prompt, result, trace_id, version
"#;

const IDLE_RUNNING_FILTER: &str = "status = 'running' AND last_activity_at < ?1 AND external_id IS NOT NULL";
const STUCK_BOOTING_FILTER: &str = "status = 'booting' AND started_at < ?1";
const RECENT_BY_CREATOR_FILTER: &str = "created_by = ?1 AND started_at >= ?2";
const WORKSPACE_WINDOW_FILTER: &str = "workspace_id = ?1 AND started_at >= ?2 AND started_at < ?3";

/// A value bound into a dynamically built UPDATE
enum Column {
    Text(Option<String>),
    Integer(Option<i64>),
    Real(Option<f64>),
}

pub struct RunStorage {
    pool: SqlitePool,
}

impl RunStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_run(&self, run: &Run) -> Result<()> {
        let error_details = run
            .error
            .as_ref()
            .and_then(|e| e.details.as_ref())
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, workspace_id, thread_id, created_by, external_id, status,
                started_at, finished_at, last_activity_at,
                max_duration_ms, idle_timeout_ms,
                error_message, error_code, error_details,
                compute_cost, agent_cost, total_cost,
                input_tokens, output_tokens, cached_tokens, duration_ms,
                prompt, result, trace_id, version
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6,
                ?7, ?8, ?9,
                ?10, ?11,
                ?12, ?13, ?14,
                ?15, ?16, ?17,
                ?18, ?19, ?20, ?21,
                ?22, ?23, ?24, ?25
            )
            "#,
        )
        .bind(&run.id)
        .bind(&run.workspace_id)
        .bind(&run.thread_id)
        .bind(&run.created_by)
        .bind(&run.external_id)
        .bind(run.status.as_str())
        .bind(run.started_at.timestamp_millis())
        .bind(run.finished_at.map(|d| d.timestamp_millis()))
        .bind(run.last_activity_at.timestamp_millis())
        .bind(run.limits.max_duration_ms)
        .bind(run.limits.idle_timeout_ms)
        .bind(run.error.as_ref().map(|e| e.message.clone()))
        .bind(run.error.as_ref().map(|e| e.code.as_str()))
        .bind(error_details)
        .bind(run.cost.map(|c| c.compute_cost))
        .bind(run.cost.map(|c| c.agent_cost))
        .bind(run.cost.map(|c| c.total_cost))
        .bind(run.token_usage.map(|t| t.input_tokens))
        .bind(run.token_usage.map(|t| t.output_tokens))
        .bind(run.token_usage.map(|t| t.cached_tokens))
        .bind(run.duration_ms)
        .bind(&run.prompt)
        .bind(&run.result)
        .bind(&run.trace_id)
        .bind(run.version)
        .execute(&self.pool)
        .await?;

        debug!("Inserted run {} in workspace {}", run.id, run.workspace_id);
        Ok(())
    }

    pub async fn get_run(&self, id: &str) -> Result<Run> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_run(&row),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Apply the fields present in `patch` only if the stored version still
    /// equals `expected_version`. Returns false when another writer got there first.
    pub async fn update_run_if_version(
        &self,
        id: &str,
        expected_version: i64,
        patch: &RunPatch,
    ) -> Result<bool> {
        let columns = patch_columns(patch)?;

        let mut query_str = String::from("UPDATE runs SET version = version + 1");
        for (name, _) in &columns {
            query_str.push_str(&format!(", {} = ?", name));
        }
        query_str.push_str(" WHERE id = ? AND version = ?");

        let mut query = sqlx::query(&query_str);
        for (_, value) in columns {
            query = match value {
                Column::Text(v) => query.bind(v),
                Column::Integer(v) => query.bind(v),
                Column::Real(v) => query.bind(v),
            };
        }

        let result = query
            .bind(id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Running runs with a sandbox attached whose last activity is older than `cutoff`
    pub async fn find_idle_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>> {
        self.select_where(
            IDLE_RUNNING_FILTER,
            "last_activity_at",
            cutoff.timestamp_millis(),
        )
        .await
    }

    /// Booting runs started before `cutoff`
    pub async fn find_stuck_booting(&self, cutoff: DateTime<Utc>) -> Result<Vec<Run>> {
        self.select_where(STUCK_BOOTING_FILTER, "started_at", cutoff.timestamp_millis())
            .await
    }

    /// Count runs created by `user_id` since `since`, never looking past `cap` rows
    pub async fn count_recent_by_creator(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        cap: u32,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM runs WHERE {} LIMIT ?3)",
            RECENT_BY_CREATOR_FILTER
        ))
        .bind(user_id)
        .bind(since.timestamp_millis())
        .bind(i64::from(cap))
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u32)
    }

    /// Runs of a workspace with `start <= started_at < end`, oldest first
    pub async fn list_in_window(
        &self,
        workspace_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE {} ORDER BY started_at",
            RUN_COLUMNS, WORKSPACE_WINDOW_FILTER
        ))
        .bind(workspace_id)
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        debug!(
            "Loaded {} runs for workspace {} in window",
            rows.len(),
            workspace_id
        );

        rows.iter().map(row_to_run).collect()
    }

    pub async fn list_for_thread(&self, thread_id: &str) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE thread_id = ?1 ORDER BY started_at DESC",
            RUN_COLUMNS
        ))
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    async fn select_where(&self, filter: &str, order_by: &str, cutoff_ms: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE {} ORDER BY {}",
            RUN_COLUMNS, filter, order_by
        ))
        .bind(cutoff_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }
}

fn patch_columns(patch: &RunPatch) -> Result<Vec<(&'static str, Column)>> {
    let mut columns = Vec::new();

    if let Some(status) = patch.status {
        columns.push(("status", Column::Text(Some(status.as_str().to_string()))));
    }
    if let Some(external_id) = &patch.external_id {
        columns.push(("external_id", Column::Text(Some(external_id.clone()))));
    }
    if let Some(finished_at) = patch.finished_at {
        columns.push((
            "finished_at",
            Column::Integer(Some(finished_at.timestamp_millis())),
        ));
    }
    if let Some(last_activity_at) = patch.last_activity_at {
        columns.push((
            "last_activity_at",
            Column::Integer(Some(last_activity_at.timestamp_millis())),
        ));
    }
    if let Some(error) = &patch.error {
        let details = error
            .details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        columns.push(("error_message", Column::Text(Some(error.message.clone()))));
        columns.push((
            "error_code",
            Column::Text(Some(error.code.as_str().to_string())),
        ));
        columns.push(("error_details", Column::Text(details)));
    }
    if let Some(cost) = patch.cost {
        columns.push(("compute_cost", Column::Real(Some(cost.compute_cost))));
        columns.push(("agent_cost", Column::Real(Some(cost.agent_cost))));
        columns.push(("total_cost", Column::Real(Some(cost.total_cost))));
    }
    if let Some(usage) = patch.token_usage {
        columns.push(("input_tokens", Column::Integer(Some(usage.input_tokens))));
        columns.push(("output_tokens", Column::Integer(Some(usage.output_tokens))));
        columns.push(("cached_tokens", Column::Integer(Some(usage.cached_tokens))));
    }
    if let Some(duration_ms) = patch.duration_ms {
        columns.push(("duration_ms", Column::Integer(Some(duration_ms))));
    }
    if let Some(prompt) = &patch.prompt {
        columns.push(("prompt", Column::Text(Some(prompt.clone()))));
    }
    if let Some(result) = &patch.result {
        columns.push(("result", Column::Text(Some(result.clone()))));
    }
    if let Some(trace_id) = &patch.trace_id {
        columns.push(("trace_id", Column::Text(Some(trace_id.clone()))));
    }

    Ok(columns)
}

fn row_to_run(row: &SqliteRow) -> Result<Run> {
    let error_message: Option<String> = row.get("error_message");
    let error_code: Option<String> = row.get("error_code");
    let error = if error_message.is_some() || error_code.is_some() {
        Some(RunFailure {
            message: error_message.unwrap_or_default(),
            code: error_code
                .as_deref()
                .map(ErrorCode::parse)
                .unwrap_or(ErrorCode::Unknown),
            details: row
                .get::<Option<String>, _>("error_details")
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    } else {
        None
    };

    let cost = row
        .get::<Option<f64>, _>("total_cost")
        .map(|total_cost| RunCost {
            compute_cost: row.get::<Option<f64>, _>("compute_cost").unwrap_or(0.0),
            agent_cost: row.get::<Option<f64>, _>("agent_cost").unwrap_or(0.0),
            total_cost,
        });

    let input_tokens: Option<i64> = row.get("input_tokens");
    let output_tokens: Option<i64> = row.get("output_tokens");
    let cached_tokens: Option<i64> = row.get("cached_tokens");
    let token_usage = if input_tokens.is_some() || output_tokens.is_some() || cached_tokens.is_some()
    {
        Some(TokenUsage {
            input_tokens: input_tokens.unwrap_or(0),
            output_tokens: output_tokens.unwrap_or(0),
            cached_tokens: cached_tokens.unwrap_or(0),
        })
    } else {
        None
    };

    Ok(Run {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        thread_id: row.get("thread_id"),
        created_by: row.get("created_by"),
        external_id: row.get("external_id"),
        status: RunStatus::from_str(&row.get::<String, _>("status"))?,
        started_at: from_millis(row.get("started_at"))?,
        finished_at: row
            .get::<Option<i64>, _>("finished_at")
            .map(from_millis)
            .transpose()?,
        last_activity_at: from_millis(row.get("last_activity_at"))?,
        limits: RunLimits {
            max_duration_ms: row.get("max_duration_ms"),
            idle_timeout_ms: row.get("idle_timeout_ms"),
        },
        error,
        cost,
        token_usage,
        duration_ms: row.get("duration_ms"),
        prompt: row.get("prompt"),
        result: row.get("result"),
        trace_id: row.get("trace_id"),
        version: row.get("version"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{new_run, setup_pool};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    async fn query_plan(pool: &SqlitePool, sql: &str, params: usize) -> String {
        let sql = format!("EXPLAIN QUERY PLAN {}", sql);
        let mut query = sqlx::query(&sql);
        for i in 0..params {
            query = if i == 0 { query.bind("x") } else { query.bind(0_i64) };
        }
        let rows = query.fetch_all(pool).await.unwrap();

        rows.iter()
            .map(|row| row.get::<String, _>("detail"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    #[tokio::test]
    async fn test_insert_and_get_run() {
        let pool = setup_pool().await;
        let storage = RunStorage::new(pool);

        let mut run = new_run("run-1", "ws-1", "alice");
        run.prompt = Some("list files".to_string());
        run.error = Some(RunFailure {
            message: "boom".to_string(),
            code: ErrorCode::AgentError,
            details: Some(serde_json::json!({"exit_code": 1})),
        });
        run.cost = Some(RunCost::new(0.1, 0.2));
        run.token_usage = Some(TokenUsage {
            input_tokens: 10,
            output_tokens: 20,
            cached_tokens: 5,
        });
        storage.insert_run(&run).await.unwrap();

        let loaded = storage.get_run("run-1").await.unwrap();
        assert_eq!(loaded, run);
    }

    #[tokio::test]
    async fn test_get_missing_run() {
        let storage = RunStorage::new(setup_pool().await);
        assert!(matches!(
            storage.get_run("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_version_guard_rejects_stale_writer() {
        let storage = RunStorage::new(setup_pool().await);
        storage
            .insert_run(&new_run("run-1", "ws-1", "alice"))
            .await
            .unwrap();

        let patch = RunPatch::status(RunStatus::Failed);
        assert!(storage.update_run_if_version("run-1", 0, &patch).await.unwrap());
        // Same expected version again: someone already bumped it
        assert!(!storage.update_run_if_version("run-1", 0, &patch).await.unwrap());

        let loaded = storage.get_run("run-1").await.unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_partial_patch_leaves_other_fields() {
        let storage = RunStorage::new(setup_pool().await);
        let mut run = new_run("run-1", "ws-1", "alice");
        run.prompt = Some("original prompt".to_string());
        run.trace_id = Some("trace-1".to_string());
        storage.insert_run(&run).await.unwrap();

        let patch = RunPatch {
            result: Some("done".to_string()),
            ..Default::default()
        };
        storage.update_run_if_version("run-1", 0, &patch).await.unwrap();

        let loaded = storage.get_run("run-1").await.unwrap();
        assert_eq!(loaded.result.as_deref(), Some("done"));
        assert_eq!(loaded.prompt.as_deref(), Some("original prompt"));
        assert_eq!(loaded.trace_id.as_deref(), Some("trace-1"));
    }

    #[tokio::test]
    async fn test_count_recent_is_capped() {
        let storage = RunStorage::new(setup_pool().await);
        for i in 0..12 {
            storage
                .insert_run(&new_run(&format!("run-{}", i), "ws-1", "alice"))
                .await
                .unwrap();
        }
        storage
            .insert_run(&new_run("run-bob", "ws-1", "bob"))
            .await
            .unwrap();

        let since = Utc::now() - Duration::hours(1);
        assert_eq!(
            storage.count_recent_by_creator("alice", since, 4).await.unwrap(),
            4
        );
        assert_eq!(
            storage.count_recent_by_creator("alice", since, 100).await.unwrap(),
            12
        );
        assert_eq!(
            storage.count_recent_by_creator("bob", since, 100).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_scans_use_indexes() {
        let pool = setup_pool().await;

        for (filter, params, index) in [
            (IDLE_RUNNING_FILTER, 1, "idx_runs_status_activity"),
            (STUCK_BOOTING_FILTER, 1, "idx_runs_status_started"),
            (RECENT_BY_CREATOR_FILTER, 2, "idx_runs_creator_started"),
            (WORKSPACE_WINDOW_FILTER, 3, "idx_runs_workspace_started"),
        ] {
            let sql = format!("SELECT id FROM runs WHERE {}", filter);
            let plan = query_plan(&pool, &sql, params).await;
            assert!(!plan.contains("SCAN runs"), "full scan for {}: {}", filter, plan);
            assert!(plan.contains(index), "expected {} for {}: {}", index, filter, plan);
        }
    }
}
