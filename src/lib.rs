/// Conductor: control plane for distributed data pipelines
///
/// This library provides resilient messaging to a shared backplane, command
/// dispatch to pipeline agents, cron scheduling, and the batch/realtime
/// workflow execution engine.

// Core configuration and setup
pub mod config;

// Resilient backplane channel - breaker, reconnect, local cache fallback
pub mod channel;

// Agent command dispatch and workflow broadcasts
pub mod dispatch;

// Topic bridges between parent and child pipelines
pub mod bridge;

// Workflow data model, pipeline graphs and storage
pub mod workflow;

// Runtime execution engine - batch/realtime runs and cron scheduling
pub mod runtime;

// HTTP API layer - operational endpoints
pub mod api;

// Server setup and initialization
pub mod server;

// Re-export commonly used types for external consumers
pub use channel::{ChannelConfig, ResilientChannel};
pub use dispatch::CommandDispatcher;
pub use runtime::{ExecutionEngine, SchedulerService};
pub use server::start_server;
pub use workflow::{PipelineSpec, Workflow};
