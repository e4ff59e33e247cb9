/// Runtime Execution Engine
///
/// This module runs workflows and keeps them running:
/// - Batch runs in topological order with per-record fan-out
/// - Realtime polling with checkpointed offsets
/// - Cron timers that start batch runs
/// - Lifecycle control (start, stop, pause, resume)

// Batch and realtime execution engine
pub mod engine;

// Individual pipeline execution handlers
pub mod executor;

// Per-record child pipeline expansion
pub mod expansion;

// Running execution tracking
pub mod registry;

// Background cron scheduler service
pub mod scheduler;

pub use engine::{EngineConfig, EngineError, ExecutionEngine, ExecutionHandle, StopOutcome};
pub use executor::{LocalPipelineRunner, PipelineOutcome, PipelineRunner, RunContext, RunnerError};
pub use expansion::{expand, ExpandedPipeline};
pub use registry::{ExecutionRegistry, RunningExecution, RunningSummary};
pub use scheduler::{ScheduleInfo, SchedulerError, SchedulerService, TriggerOutcome};
