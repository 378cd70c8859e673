// ABOUTME: Library side of the Sandkeep operator CLI
// ABOUTME: Wiring of storage, manager and reaper from config, plus table rendering

pub mod context;
pub mod tables;

pub use context::{init_tracing, ControlPlane};
