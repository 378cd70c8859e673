// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Sandkeep

// Storage
pub const SANDKEEP_DATABASE_URL: &str = "SANDKEEP_DATABASE_URL";

// Reaper
pub const SANDKEEP_REAPER_INTERVAL_SECS: &str = "SANDKEEP_REAPER_INTERVAL_SECS";
pub const SANDKEEP_IDLE_TIMEOUT_SECS: &str = "SANDKEEP_IDLE_TIMEOUT_SECS";
pub const SANDKEEP_BOOT_TIMEOUT_SECS: &str = "SANDKEEP_BOOT_TIMEOUT_SECS";
pub const SANDKEEP_REAPER_BATCH_SIZE: &str = "SANDKEEP_REAPER_BATCH_SIZE";
pub const SANDKEEP_KILL_TIMEOUT_SECS: &str = "SANDKEEP_KILL_TIMEOUT_SECS";

// Rate Limiting
pub const SANDKEEP_RATE_LIMIT_RUNS: &str = "SANDKEEP_RATE_LIMIT_RUNS";
pub const SANDKEEP_RATE_LIMIT_WINDOW_SECS: &str = "SANDKEEP_RATE_LIMIT_WINDOW_SECS";

// Heartbeats
pub const SANDKEEP_HEARTBEAT_INTERVAL_SECS: &str = "SANDKEEP_HEARTBEAT_INTERVAL_SECS";

// E2B provisioning
pub const E2B_API_KEY: &str = "E2B_API_KEY";
pub const E2B_API_URL: &str = "E2B_API_URL";
pub const E2B_TEMPLATE_ID: &str = "E2B_TEMPLATE_ID";

// Defaults
pub const DEFAULT_DATABASE_URL: &str = "sqlite://sandkeep.db";
pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_REAPER_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_REAPER_BATCH_SIZE: usize = 10;
pub const DEFAULT_KILL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_RUNS: u32 = 20;
pub const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 3600;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
