/// Core workflow type definitions
///
/// Defines workflows, their pipeline specs and schedule configuration. These
/// types are serialized to JSON for persistence and travel unchanged between
/// the scheduler, the execution engine and the topic bridge manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// A schedulable unit composed of one or more pipeline specs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// URL/topic-safe slug, used to name bridge topics
    #[serde(default)]
    pub slug: String,
    /// Owning project reference
    #[serde(default)]
    pub project_id: String,
    /// Batch runs terminate, realtime runs poll until stopped
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    /// How independent pipelines are scheduled within a batch run
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    /// Pipeline graph (parent and depends_on edges must form a DAG)
    #[serde(default)]
    pub pipelines: Vec<PipelineSpec>,
    /// Schedule configuration (only cron schedules of batch workflows fire)
    #[serde(default)]
    pub schedule: ScheduleSpec,
    /// Current lifecycle status
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Slug used for topic naming, falling back to the id when unset
    pub fn topic_slug(&self) -> &str {
        if self.slug.is_empty() {
            &self.id
        } else {
            &self.slug
        }
    }

    /// Whether the scheduler should hold a timer for this workflow
    pub fn is_cron_scheduled(&self) -> bool {
        self.workflow_type == WorkflowType::Batch
            && self.schedule.enabled
            && self.schedule.schedule_type == ScheduleType::Cron
            && self
                .schedule
                .cron_expression
                .as_deref()
                .is_some_and(|expr| !expr.trim().is_empty())
    }
}

/// Closed set of workflow kinds, each with a single execution entry point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Batch,
    Realtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Independent pipelines of the same topological level run concurrently
    Parallel,
    /// One pipeline at a time in topological order
    Sequential,
    /// Same as sequential; the order is derived purely from graph edges
    #[default]
    Dag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Idle => "idle",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Stopped => "stopped",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Completed => "completed",
        }
    }
}

/// Schedule configuration attached to a workflow
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    /// Standard 5-field or 6-field (with seconds) cron expression
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// IANA timezone name; unknown names fall back to UTC
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Manual,
    Cron,
}

/// One source -> transform -> sink configuration within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Unique within the owning workflow
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub source: Value,
    #[serde(default)]
    pub transform: Option<Value>,
    /// Sink configurations; bridge topics are appended here by the topic bridge manager
    #[serde(default)]
    pub sinks: Vec<Value>,
    /// Containment edge: the parent runs first and may feed this pipeline
    #[serde(default)]
    pub parent_pipeline_id: Option<String>,
    /// Plain ordering edges
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub expansion_mode: ExpansionMode,
    #[serde(default)]
    pub parameter_bindings: Vec<ParameterBinding>,
    /// Data type whose backing store holds this pipeline's output records
    #[serde(default)]
    pub target_data_type_id: Option<String>,
    /// Execution agent assigned to this pipeline, if any
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl PipelineSpec {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: Value::Null,
            transform: None,
            sinks: Vec::new(),
            parent_pipeline_id: None,
            depends_on: Vec::new(),
            expansion_mode: ExpansionMode::None,
            parameter_bindings: Vec::new(),
            target_data_type_id: None,
            agent_id: None,
        }
    }

    /// Parent id, treating an empty string as no parent
    pub fn parent(&self) -> Option<&str> {
        self.parent_pipeline_id
            .as_deref()
            .filter(|parent| !parent.is_empty())
    }

    /// Every pipeline that must run before this one
    pub fn prerequisites(&self) -> impl Iterator<Item = &str> {
        let mut seen = HashSet::new();
        self.parent()
            .into_iter()
            .chain(self.depends_on.iter().map(String::as_str))
            .filter(move |id| !id.is_empty() && seen.insert(*id))
    }

    pub fn expands_per_record(&self) -> bool {
        self.expansion_mode == ExpansionMode::ForEachRecord && self.parent().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionMode {
    #[default]
    None,
    ForEachRecord,
}

/// Copies a field of a parent output record into the child's source config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBinding {
    /// Record field name, or a JSONPath expression starting with `$`
    pub parent_field: String,
    /// Key set on the child's source configuration
    pub child_param: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prerequisites_dedupe_parent_and_depends_on() {
        let mut spec = PipelineSpec::new("c", "child");
        spec.parent_pipeline_id = Some("p".into());
        spec.depends_on = vec!["p".into(), "q".into(), String::new()];
        let prereqs: Vec<&str> = spec.prerequisites().collect();
        assert_eq!(prereqs, vec!["p", "q"]);
    }

    #[test]
    fn empty_parent_is_no_parent() {
        let mut spec = PipelineSpec::new("c", "child");
        spec.parent_pipeline_id = Some(String::new());
        spec.expansion_mode = ExpansionMode::ForEachRecord;
        assert!(spec.parent().is_none());
        assert!(!spec.expands_per_record());
    }

    #[test]
    fn workflow_deserializes_with_defaults() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "Orders",
            "type": "batch",
            "pipelines": [{"id": "a", "name": "A"}],
            "schedule": {"enabled": true, "schedule_type": "cron", "cron_expression": "*/5 * * * *"}
        }))
        .unwrap();

        assert_eq!(workflow.workflow_type, WorkflowType::Batch);
        assert_eq!(workflow.execution_mode, ExecutionMode::Dag);
        assert_eq!(workflow.status, WorkflowStatus::Idle);
        assert_eq!(workflow.topic_slug(), "wf-1");
        assert!(workflow.is_cron_scheduled());
    }

    #[test]
    fn realtime_workflows_are_never_cron_scheduled() {
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf-rt",
            "name": "Stream",
            "type": "realtime",
            "schedule": {"enabled": true, "schedule_type": "cron", "cron_expression": "* * * * *"}
        }))
        .unwrap();
        assert!(!workflow.is_cron_scheduled());
    }
}
