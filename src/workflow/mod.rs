/// Workflow Management Layer
///
/// Data model and persistence for workflows and their executions:
/// - Type definitions (Workflow, PipelineSpec, ScheduleSpec)
/// - Execution records, offsets and hourly statistics
/// - Pipeline graph ordering with cycle rejection
/// - Store traits with SQLite (sqlx) and in-memory implementations

// Core workflow type definitions
pub mod types;

// Execution records and checkpoint types
pub mod execution;

// petgraph-based ordering of pipeline specs
pub mod graph;

// Store traits and the SQLite implementation
pub mod storage;

// In-memory store
pub mod memory;

// Re-export commonly used types
pub use execution::{
    ExecutionStatus, ExecutionUpdate, HourlyStats, OffsetMap, PipelineResult, TriggeredBy,
    WorkflowExecution,
};
pub use graph::{GraphError, PipelineGraph};
pub use memory::MemoryWorkflowStore;
pub use storage::{RecordStore, SqliteWorkflowStore, StoreError, StoredRecord, WorkflowStore};
pub use types::{
    ExecutionMode, ExpansionMode, ParameterBinding, PipelineSpec, ScheduleSpec, ScheduleType,
    Workflow, WorkflowStatus, WorkflowType,
};
