// ABOUTME: Builds the control plane components from configuration
// ABOUTME: Opens and migrates the database, constructs the reaper and analytics, installs logging

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use sandkeep_config::ControlPlaneConfig;
use sandkeep_runs::{
    AnalyticsAggregator, E2bProvisioner, Reaper, ReaperConfig, RunManager, StoredWorkspaceAccess,
};
use sandkeep_storage::{open_pool, run_migrations, SqlitePool, WorkspaceStorage};

/// Log to stderr, filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

pub struct ControlPlane {
    pub config: ControlPlaneConfig,
    pub pool: SqlitePool,
    pub manager: Arc<RunManager>,
}

impl ControlPlane {
    /// Open the configured database and bring its schema up to date
    pub async fn connect(config: ControlPlaneConfig) -> Result<Self> {
        let pool = open_pool(&config.database_url)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_url))?;
        run_migrations(&pool)
            .await
            .context("Failed to apply migrations")?;

        info!("Connected to {}", config.database_url);

        Ok(Self::with_pool(config, pool))
    }

    /// Wrap an already migrated pool
    pub fn with_pool(config: ControlPlaneConfig, pool: SqlitePool) -> Self {
        Self {
            manager: Arc::new(RunManager::new(pool.clone())),
            config,
            pool,
        }
    }

    pub fn workspaces(&self) -> WorkspaceStorage {
        WorkspaceStorage::new(self.pool.clone())
    }

    pub fn analytics(&self) -> AnalyticsAggregator {
        AnalyticsAggregator::new(
            self.pool.clone(),
            Arc::new(StoredWorkspaceAccess::new(self.pool.clone())),
        )
    }

    /// Reaper backed by E2B; requires `E2B_API_KEY`
    pub fn reaper(&self) -> Result<Arc<Reaper>> {
        let settings = self
            .config
            .e2b
            .as_ref()
            .context("E2B_API_KEY must be set to reap sandboxes")?;
        let provisioner = E2bProvisioner::from_settings(settings)?;

        Ok(Arc::new(Reaper::new(
            self.manager.clone(),
            Arc::new(provisioner),
            ReaperConfig::from(&self.config),
        )))
    }
}
