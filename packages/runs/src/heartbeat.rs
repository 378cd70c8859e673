// ABOUTME: Throttled activity reporting for a single run
// ABOUTME: Long-running sessions call beat() freely; at most one write per interval reaches storage

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use sandkeep_config::ControlPlaneConfig;

use crate::error::Result;
use crate::manager::RunManager;

pub struct Heartbeat {
    manager: Arc<RunManager>,
    run_id: String,
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl Heartbeat {
    pub fn new(manager: Arc<RunManager>, run_id: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            manager,
            run_id: run_id.into(),
            min_interval,
            last_sent: Mutex::new(None),
        }
    }

    pub fn from_config(
        manager: Arc<RunManager>,
        run_id: impl Into<String>,
        config: &ControlPlaneConfig,
    ) -> Self {
        Self::new(manager, run_id, config.heartbeat_interval)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Record activity unless one was recorded less than `min_interval` ago.
    /// Returns whether a write happened.
    pub async fn beat(&self) -> Result<bool> {
        let mut last_sent = self.last_sent.lock().await;

        if let Some(at) = *last_sent {
            if at.elapsed() < self.min_interval {
                return Ok(false);
            }
        }

        self.manager.heartbeat(&self.run_id).await?;
        *last_sent = Some(Instant::now());
        debug!("Heartbeat recorded for run {}", self.run_id);
        Ok(true)
    }
}
