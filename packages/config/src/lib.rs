// ABOUTME: Configuration for the Sandkeep control plane
// ABOUTME: Environment variable names, defaults and the parsed settings struct

pub mod constants;
pub mod settings;

pub use settings::{ConfigError, ControlPlaneConfig, E2bSettings};
