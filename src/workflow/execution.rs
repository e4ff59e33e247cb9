/// Execution bookkeeping types
///
/// One `WorkflowExecution` is recorded per invocation attempt. It is created
/// when a run starts and updated exactly once at its terminal transition.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Last processed position per pipeline of a realtime workflow
pub type OffsetMap = BTreeMap<String, i64>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_records: u64,
    pub failed_records: u64,
    /// Serialized `Vec<PipelineResult>`
    pub results: Option<String>,
    pub triggered_by: TriggeredBy,
    /// Operator that triggered a manual run
    pub user_id: Option<String>,
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// New running execution with a fresh id
    pub fn start(workflow_id: &str, triggered_by: TriggeredBy, user_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            total_records: 0,
            failed_records: 0,
            results: None,
            triggered_by,
            user_id,
            error: None,
        }
    }

    /// Decode the stored per-pipeline results
    pub fn pipeline_results(&self) -> Vec<PipelineResult> {
        self.results
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn apply(&mut self, update: &ExecutionUpdate) {
        self.status = update.status;
        self.completed_at = update.completed_at;
        self.total_records = update.total_records;
        self.failed_records = update.failed_records;
        self.results = update.results.clone();
        self.error = update.error.clone();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Stopped,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    User,
    Schedule,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::User => "user",
            TriggeredBy::Schedule => "schedule",
        }
    }
}

/// Terminal fields written to an execution record
#[derive(Debug, Clone)]
pub struct ExecutionUpdate {
    pub status: ExecutionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_records: u64,
    pub failed_records: u64,
    pub results: Option<String>,
    pub error: Option<String>,
}

impl ExecutionUpdate {
    pub fn finished(status: ExecutionStatus, results: &[PipelineResult]) -> Self {
        let total_records = results.iter().map(|r| r.records_processed).sum();
        let failed_records = results.iter().map(|r| r.records_failed).sum();
        Self {
            status,
            completed_at: Some(Utc::now()),
            total_records,
            failed_records,
            results: serde_json::to_string(results).ok(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Outcome of one (possibly expanded) pipeline run within an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_id: String,
    /// `{name}` for plain runs, `{name}[{index}]` for expanded runs
    pub name: String,
    pub success: bool,
    pub records_processed: u64,
    pub records_failed: u64,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One aggregation row per pipeline per UTC hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyStats {
    pub workflow_id: String,
    pub pipeline_id: String,
    pub hour: DateTime<Utc>,
    pub records_processed: u64,
    pub records_failed: u64,
    pub samples: u64,
}

/// Start of the UTC hour containing `at`
pub fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(TimeDelta::hours(1)).unwrap_or(at)
}
