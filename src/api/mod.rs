/// HTTP API Layer
///
/// Operational endpoints only: health, channel metrics, running executions,
/// schedules and lifecycle control of executions.

// Operational endpoints (health, metrics, executions, schedules)
pub mod ops;

pub use ops::{create_ops_routes, OpsState};
