// ABOUTME: Control plane settings loaded from environment variables
// ABOUTME: Reaper timing, rate limits, heartbeat throttling and E2B credentials

use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::constants::*;

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidNumber { name: String, value: String },
    #[error("{0} must be greater than zero")]
    Zero(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct E2bSettings {
    pub api_key: String,
    pub api_url: String,
    pub template_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlPlaneConfig {
    pub database_url: String,

    // Reaper
    pub reaper_interval: Duration,
    pub idle_timeout: Duration,
    pub boot_timeout: Duration,
    pub reaper_batch_size: usize,
    pub kill_timeout: Duration,

    // Rate limiting
    pub rate_limit_runs: u32,
    pub rate_limit_window: Duration,

    pub heartbeat_interval: Duration,

    /// Present only when `E2B_API_KEY` is set
    pub e2b: Option<E2bSettings>,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            reaper_interval: Duration::from_secs(DEFAULT_REAPER_INTERVAL_SECS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            boot_timeout: Duration::from_secs(DEFAULT_BOOT_TIMEOUT_SECS),
            reaper_batch_size: DEFAULT_REAPER_BATCH_SIZE,
            kill_timeout: Duration::from_secs(DEFAULT_KILL_TIMEOUT_SECS),
            rate_limit_runs: DEFAULT_RATE_LIMIT_RUNS,
            rate_limit_window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            e2b: None,
        }
    }
}

impl ControlPlaneConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url =
            env::var(SANDKEEP_DATABASE_URL).unwrap_or_else(|_| defaults.database_url.clone());

        // Min 5s, max 1 hour
        let reaper_interval_secs = parse_env(
            SANDKEEP_REAPER_INTERVAL_SECS,
            DEFAULT_REAPER_INTERVAL_SECS,
        )?
        .clamp(5, 3600);

        let idle_timeout_secs = non_zero(
            SANDKEEP_IDLE_TIMEOUT_SECS,
            parse_env(SANDKEEP_IDLE_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS)?,
        )?;
        let boot_timeout_secs = non_zero(
            SANDKEEP_BOOT_TIMEOUT_SECS,
            parse_env(SANDKEEP_BOOT_TIMEOUT_SECS, DEFAULT_BOOT_TIMEOUT_SECS)?,
        )?;
        let reaper_batch_size = non_zero(
            SANDKEEP_REAPER_BATCH_SIZE,
            parse_env(SANDKEEP_REAPER_BATCH_SIZE, DEFAULT_REAPER_BATCH_SIZE)?,
        )?;
        let kill_timeout_secs = non_zero(
            SANDKEEP_KILL_TIMEOUT_SECS,
            parse_env(SANDKEEP_KILL_TIMEOUT_SECS, DEFAULT_KILL_TIMEOUT_SECS)?,
        )?;
        let rate_limit_runs = parse_env(SANDKEEP_RATE_LIMIT_RUNS, DEFAULT_RATE_LIMIT_RUNS)?;
        let rate_limit_window_secs = non_zero(
            SANDKEEP_RATE_LIMIT_WINDOW_SECS,
            parse_env(
                SANDKEEP_RATE_LIMIT_WINDOW_SECS,
                DEFAULT_RATE_LIMIT_WINDOW_SECS,
            )?,
        )?;
        let heartbeat_interval_secs = parse_env(
            SANDKEEP_HEARTBEAT_INTERVAL_SECS,
            DEFAULT_HEARTBEAT_INTERVAL_SECS,
        )?;

        let e2b = env::var(E2B_API_KEY)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(|api_key| E2bSettings {
                api_key,
                api_url: env::var(E2B_API_URL)
                    .unwrap_or_else(|_| DEFAULT_E2B_API_URL.to_string()),
                template_id: env::var(E2B_TEMPLATE_ID).ok().filter(|t| !t.is_empty()),
            });

        if e2b.is_none() {
            debug!("{} not set, E2B provisioning disabled", E2B_API_KEY);
        }

        Ok(Self {
            database_url,
            reaper_interval: Duration::from_secs(reaper_interval_secs),
            idle_timeout: Duration::from_secs(idle_timeout_secs),
            boot_timeout: Duration::from_secs(boot_timeout_secs),
            reaper_batch_size,
            kill_timeout: Duration::from_secs(kill_timeout_secs),
            rate_limit_runs,
            rate_limit_window: Duration::from_secs(rate_limit_window_secs),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_secs),
            e2b,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber {
                    name: name.to_string(),
                    value: raw,
                })
        }
        _ => Ok(default),
    }
}

fn non_zero<T: Default + PartialEq>(name: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Zero(name.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            SANDKEEP_DATABASE_URL,
            SANDKEEP_REAPER_INTERVAL_SECS,
            SANDKEEP_IDLE_TIMEOUT_SECS,
            SANDKEEP_BOOT_TIMEOUT_SECS,
            SANDKEEP_REAPER_BATCH_SIZE,
            SANDKEEP_KILL_TIMEOUT_SECS,
            SANDKEEP_RATE_LIMIT_RUNS,
            SANDKEEP_RATE_LIMIT_WINDOW_SECS,
            SANDKEEP_HEARTBEAT_INTERVAL_SECS,
            E2B_API_KEY,
            E2B_API_URL,
            E2B_TEMPLATE_ID,
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_env_empty() {
        clear_env();
        let config = ControlPlaneConfig::from_env().unwrap();
        assert_eq!(config, ControlPlaneConfig::default());
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.reaper_batch_size, 10);
        assert!(config.e2b.is_none());
    }

    #[test]
    #[serial]
    fn test_reaper_interval_is_clamped() {
        clear_env();
        env::set_var(SANDKEEP_REAPER_INTERVAL_SECS, "1");
        let config = ControlPlaneConfig::from_env().unwrap();
        assert_eq!(config.reaper_interval, Duration::from_secs(5));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_number_is_rejected() {
        clear_env();
        env::set_var(SANDKEEP_IDLE_TIMEOUT_SECS, "ten minutes");
        let err = ControlPlaneConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_zero_batch_size_is_rejected() {
        clear_env();
        env::set_var(SANDKEEP_REAPER_BATCH_SIZE, "0");
        let err = ControlPlaneConfig::from_env().unwrap_err();
        assert_eq!(err, ConfigError::Zero(SANDKEEP_REAPER_BATCH_SIZE.to_string()));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_e2b_settings_loaded() {
        clear_env();
        env::set_var(E2B_API_KEY, "e2b_test_key");
        env::set_var(E2B_TEMPLATE_ID, "agent-base");
        let config = ControlPlaneConfig::from_env().unwrap();
        let e2b = config.e2b.unwrap();
        assert_eq!(e2b.api_key, "e2b_test_key");
        assert_eq!(e2b.api_url, DEFAULT_E2B_API_URL);
        assert_eq!(e2b.template_id.as_deref(), Some("agent-base"));
        clear_env();
    }
}
