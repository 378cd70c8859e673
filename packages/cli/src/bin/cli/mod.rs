pub mod analytics;
pub mod workspace;
