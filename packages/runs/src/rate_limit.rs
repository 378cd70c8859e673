// ABOUTME: Per-user run creation rate limiting
// ABOUTME: Counts recent runs with a capped indexed query and rejects creators over the limit

use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::warn;

use sandkeep_config::ControlPlaneConfig;

use crate::error::{Result, RunError};
use crate::manager::cutoff_before;
use crate::storage::RunStorage;

pub struct RateLimiter {
    runs: RunStorage,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(pool: SqlitePool, limit: u32, window: Duration) -> Self {
        Self {
            runs: RunStorage::new(pool),
            limit,
            window,
        }
    }

    pub fn from_config(pool: SqlitePool, config: &ControlPlaneConfig) -> Self {
        Self::new(pool, config.rate_limit_runs, config.rate_limit_window)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Runs created by `user_id` within `window`, counted up to `limit + 1`
    pub async fn count_recent(&self, user_id: &str, window: Duration) -> Result<u32> {
        let since = cutoff_before(Utc::now(), window);
        let count = self
            .runs
            .count_recent_by_creator(user_id, since, self.limit.saturating_add(1))
            .await?;
        Ok(count)
    }

    /// Fail with `RateLimited` once `user_id` has used up the window
    pub async fn check(&self, user_id: &str) -> Result<()> {
        let count = self.count_recent(user_id, self.window).await?;
        if count >= self.limit {
            warn!(
                "Rate limit hit for {}: {} runs in the last {}s",
                user_id,
                count,
                self.window.as_secs()
            );
            return Err(RunError::RateLimited {
                user_id: user_id.to_string(),
                limit: self.limit,
                window_secs: self.window.as_secs(),
            });
        }
        Ok(())
    }
}
