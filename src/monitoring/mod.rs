/// Exchange health snapshots
pub mod health;

pub use health::{summarize, HealthStatus, OverallHealth};
