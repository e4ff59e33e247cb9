/// In-process store for standalone runs and tests

use crate::workflow::execution::{ExecutionUpdate, HourlyStats, OffsetMap, WorkflowExecution};
use crate::workflow::storage::{RecordStore, StoreError, StoredRecord, WorkflowStore};
use crate::workflow::types::Workflow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct MemoryState {
    workflows: BTreeMap<String, Workflow>,
    executions: HashMap<String, WorkflowExecution>,
    checkpoints: HashMap<String, OffsetMap>,
    hourly: BTreeMap<(String, String, DateTime<Utc>), HourlyStats>,
    records: HashMap<String, Vec<StoredRecord>>,
}

/// `WorkflowStore` + `RecordStore` backed by plain maps
#[derive(Debug, Default)]
pub struct MemoryWorkflowStore {
    state: RwLock<MemoryState>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self.state.read().workflows.get(id).cloned())
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.state
            .write()
            .workflows
            .insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self.state.read().workflows.values().cloned().collect())
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.state
            .write()
            .executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn update_execution(&self, id: &str, update: &ExecutionUpdate) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let execution = state
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::ExecutionNotFound(id.to_string()))?;
        execution.apply(update);
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.state.read().executions.get(id).cloned())
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError> {
        let mut executions: Vec<WorkflowExecution> = self
            .state
            .read()
            .executions
            .values()
            .filter(|execution| execution.workflow_id == workflow_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(executions)
    }

    async fn save_checkpoint(&self, workflow_id: &str, offsets: &OffsetMap) -> Result<(), StoreError> {
        self.state
            .write()
            .checkpoints
            .insert(workflow_id.to_string(), offsets.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, workflow_id: &str) -> Result<Option<OffsetMap>, StoreError> {
        Ok(self.state.read().checkpoints.get(workflow_id).cloned())
    }

    async fn record_hourly_stats(
        &self,
        workflow_id: &str,
        pipeline_id: &str,
        hour: DateTime<Utc>,
        records_processed: u64,
        records_failed: u64,
    ) -> Result<(), StoreError> {
        let key = (workflow_id.to_string(), pipeline_id.to_string(), hour);
        let mut state = self.state.write();
        let bucket = state.hourly.entry(key).or_insert_with(|| HourlyStats {
            workflow_id: workflow_id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            hour,
            records_processed: 0,
            records_failed: 0,
            samples: 0,
        });
        bucket.records_processed += records_processed;
        bucket.records_failed += records_failed;
        bucket.samples += 1;
        Ok(())
    }

    async fn hourly_stats(&self, workflow_id: &str) -> Result<Vec<HourlyStats>, StoreError> {
        let mut stats: Vec<HourlyStats> = self
            .state
            .read()
            .hourly
            .values()
            .filter(|bucket| bucket.workflow_id == workflow_id)
            .cloned()
            .collect();
        stats.sort_by(|a, b| a.hour.cmp(&b.hour).then_with(|| a.pipeline_id.cmp(&b.pipeline_id)));
        Ok(stats)
    }
}

#[async_trait]
impl RecordStore for MemoryWorkflowStore {
    async fn read_records(
        &self,
        data_type_id: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let after = after.unwrap_or(0);
        Ok(self
            .state
            .read()
            .records
            .get(data_type_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| record.offset > after)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn append_records(&self, data_type_id: &str, records: &[Value]) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let stored = state.records.entry(data_type_id.to_string()).or_default();
        for record in records {
            let offset = stored.len() as i64 + 1;
            stored.push(StoredRecord {
                offset,
                data: record.clone(),
            });
        }
        Ok(records.len() as u64)
    }
}
