/// Pipeline execution handlers
///
/// `PipelineRunner` is the seam between the engine and whatever actually moves
/// records. `LocalPipelineRunner` runs a pipeline in-process:
/// - Sources: `inline` (records embedded in the config) and `data_type`
///   (reads the record store after the last checkpointed offset)
/// - Transform: optional `select` projection
/// - Sinks: `data_type` (appends to the record store) and bridge `topic`
///   sinks, which the log broker delivers out of process
///
/// Records that are not JSON objects are counted as failed and dropped.

use crate::workflow::{PipelineSpec, RecordStore, StoreError};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Per-run inputs handed to a runner
#[derive(Debug, Clone)]
pub struct RunContext {
    pub workflow_id: String,
    pub execution_id: String,
    /// Last processed offset of this pipeline (realtime runs only)
    pub offset: Option<i64>,
    pub cancel: CancellationToken,
}

/// Result of running one pipeline once
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutcome {
    pub records_processed: u64,
    pub records_failed: u64,
    /// Records emitted after the transform
    pub output: Vec<Value>,
    /// New last-processed offset, when the source reports positions
    pub offset: Option<i64>,
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("pipeline {pipeline}: {reason}")]
    InvalidConfig { pipeline: String, reason: String },

    #[error("pipeline run cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, spec: &PipelineSpec, ctx: &RunContext) -> Result<PipelineOutcome, RunnerError>;
}

const DEFAULT_READ_LIMIT: usize = 1000;

/// In-process runner backed by a record store
pub struct LocalPipelineRunner {
    records: Arc<dyn RecordStore>,
}

impl LocalPipelineRunner {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Read source records as `(position, record)` pairs
    async fn read_source(&self, spec: &PipelineSpec, ctx: &RunContext) -> Result<Vec<(i64, Value)>, RunnerError> {
        let source_type = spec.source.get("type").and_then(Value::as_str);
        match source_type {
            None => Ok(Vec::new()),
            Some("inline") => {
                let records = spec
                    .source
                    .get("records")
                    .and_then(Value::as_array)
                    .ok_or_else(|| invalid(spec, "inline source requires a 'records' array"))?;
                let after = ctx.offset.unwrap_or(0);
                Ok(records
                    .iter()
                    .enumerate()
                    .map(|(i, record)| (i as i64 + 1, record.clone()))
                    .filter(|(position, _)| *position > after)
                    .collect())
            }
            Some("data_type") => {
                let data_type = spec
                    .source
                    .get("data_type_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(spec, "data_type source requires 'data_type_id'"))?;
                let limit = spec
                    .source
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|limit| limit as usize)
                    .unwrap_or(DEFAULT_READ_LIMIT);
                let stored = self.records.read_records(data_type, ctx.offset, limit).await?;
                Ok(stored.into_iter().map(|record| (record.offset, record.data)).collect())
            }
            Some("topic") => {
                // bridge topics are consumed by the agents, not in-process
                tracing::debug!(pipeline = %spec.id, "Topic source is consumed by the log broker");
                Ok(Vec::new())
            }
            Some(other) => Err(invalid(spec, &format!("unsupported source type '{}'", other))),
        }
    }

    async fn write_sinks(&self, spec: &PipelineSpec, output: &[Value]) -> Result<(), RunnerError> {
        for sink in &spec.sinks {
            match sink.get("type").and_then(Value::as_str) {
                Some("data_type") => {
                    let data_type = sink
                        .get("data_type_id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| invalid(spec, "data_type sink requires 'data_type_id'"))?;
                    let written = self.records.append_records(data_type, output).await?;
                    tracing::debug!("💾 Pipeline {} wrote {} records to {}", spec.id, written, data_type);
                }
                Some("topic") => {
                    let topic = sink.get("topic").and_then(Value::as_str).unwrap_or_default();
                    tracing::debug!(
                        pipeline = %spec.id,
                        topic,
                        records = output.len(),
                        "Records handed to bridge topic"
                    );
                }
                Some(other) => return Err(invalid(spec, &format!("unsupported sink type '{}'", other))),
                None => return Err(invalid(spec, "sink without 'type'")),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineRunner for LocalPipelineRunner {
    async fn run(&self, spec: &PipelineSpec, ctx: &RunContext) -> Result<PipelineOutcome, RunnerError> {
        if ctx.cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }

        let input = self.read_source(spec, ctx).await?;
        let offset = input.last().map(|(position, _)| *position);
        let projection = Projection::from_spec(spec)?;

        let mut outcome = PipelineOutcome {
            offset,
            ..PipelineOutcome::default()
        };
        for (_, record) in input {
            match record {
                Value::Object(fields) => {
                    outcome.output.push(projection.apply(fields));
                    outcome.records_processed += 1;
                }
                other => {
                    tracing::debug!(pipeline = %spec.id, "Dropping non-object record: {}", other);
                    outcome.records_failed += 1;
                }
            }
        }

        self.write_sinks(spec, &outcome.output).await?;
        Ok(outcome)
    }
}

/// Optional `{"type": "select", "fields": [...]}` transform
enum Projection {
    All,
    Fields(Vec<String>),
}

impl Projection {
    fn from_spec(spec: &PipelineSpec) -> Result<Self, RunnerError> {
        let Some(transform) = spec.transform.as_ref().filter(|t| !t.is_null()) else {
            return Ok(Projection::All);
        };
        match transform.get("type").and_then(Value::as_str) {
            Some("select") => {
                let fields = transform
                    .get("fields")
                    .and_then(Value::as_array)
                    .ok_or_else(|| invalid(spec, "select transform requires a 'fields' array"))?
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect();
                Ok(Projection::Fields(fields))
            }
            Some(other) => Err(invalid(spec, &format!("unsupported transform type '{}'", other))),
            None => Err(invalid(spec, "transform without 'type'")),
        }
    }

    fn apply(&self, mut record: Map<String, Value>) -> Value {
        match self {
            Projection::All => Value::Object(record),
            Projection::Fields(fields) => Value::Object(
                fields
                    .iter()
                    .filter_map(|field| record.remove(field).map(|value| (field.clone(), value)))
                    .collect(),
            ),
        }
    }
}

fn invalid(spec: &PipelineSpec, reason: &str) -> RunnerError {
    RunnerError::InvalidConfig {
        pipeline: spec.id.clone(),
        reason: reason.to_string(),
    }
}
