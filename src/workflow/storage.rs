/// Persistence layer for workflows, executions and pipeline data
///
/// The core treats the relational store as a CRUD collaborator: whole
/// workflow rows are loaded and saved, executions are created once and
/// updated at their terminal transition. `SqliteWorkflowStore` is the sqlx
/// implementation; `MemoryWorkflowStore` lives in `workflow::memory`.

use crate::workflow::execution::{
    ExecutionUpdate, HourlyStats, OffsetMap, TriggeredBy, WorkflowExecution,
};
use crate::workflow::types::{Workflow, WorkflowStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow},
    Row,
};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// CRUD access to workflow and execution rows
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError>;

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn update_execution(&self, id: &str, update: &ExecutionUpdate) -> Result<(), StoreError>;

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Executions of one workflow, newest first
    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError>;

    /// Durable copy of a realtime workflow's offsets
    async fn save_checkpoint(&self, workflow_id: &str, offsets: &OffsetMap) -> Result<(), StoreError>;

    async fn load_checkpoint(&self, workflow_id: &str) -> Result<Option<OffsetMap>, StoreError>;

    /// Fold one tick into the pipeline's bucket for `hour`, creating it if absent
    async fn record_hourly_stats(
        &self,
        workflow_id: &str,
        pipeline_id: &str,
        hour: DateTime<Utc>,
        records_processed: u64,
        records_failed: u64,
    ) -> Result<(), StoreError>;

    async fn hourly_stats(&self, workflow_id: &str) -> Result<Vec<HourlyStats>, StoreError>;

    /// Batch workflows with an enabled cron schedule
    async fn list_scheduled_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        Ok(self
            .list_workflows()
            .await?
            .into_iter()
            .filter(Workflow::is_cron_scheduled)
            .collect())
    }

    async fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<(), StoreError> {
        let mut workflow = self
            .load_workflow(id)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        workflow.status = status;
        self.save_workflow(&workflow).await
    }

    async fn set_run_times(
        &self,
        id: &str,
        last_run_at: Option<DateTime<Utc>>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut workflow = self
            .load_workflow(id)
            .await?
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        if last_run_at.is_some() {
            workflow.last_run_at = last_run_at;
        }
        workflow.next_run_at = next_run_at;
        self.save_workflow(&workflow).await
    }
}

/// A record in a data type's backing store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Monotonic position within the data type, starting at 1
    pub offset: i64,
    pub data: Value,
}

/// Backing store of data types, read by sources and written by sinks
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records with an offset greater than `after`, oldest first
    async fn read_records(
        &self,
        data_type_id: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Append records, returning how many were written
    async fn append_records(&self, data_type_id: &str, records: &[Value]) -> Result<u64, StoreError>;
}

/// SQLite-backed store
///
/// Workflow definitions are kept as JSON next to their indexed id and name;
/// executions, checkpoints, hourly stats and data-type records get their own tables.
#[derive(Debug, Clone)]
pub struct SqliteWorkflowStore {
    pool: SqlitePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a `sqlite://` URL, creating the file and schema if missing
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        Self::connect_with(options).await
    }

    /// Open (or create) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect_with(options).await
    }

    async fn connect_with(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                definition JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                total_records INTEGER NOT NULL DEFAULT 0,
                failed_records INTEGER NOT NULL DEFAULT 0,
                results JSON,
                triggered_by TEXT NOT NULL,
                user_id TEXT,
                error TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                workflow_id TEXT PRIMARY KEY,
                offsets JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_hourly_stats (
                workflow_id TEXT NOT NULL,
                pipeline_id TEXT NOT NULL,
                hour TEXT NOT NULL,
                records_processed INTEGER NOT NULL DEFAULT 0,
                records_failed INTEGER NOT NULL DEFAULT 0,
                samples INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (workflow_id, pipeline_id, hour)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS data_type_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_type_id TEXT NOT NULL,
                data JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_workflows_name ON workflows(name)",
            "CREATE INDEX IF NOT EXISTS idx_executions_workflow ON workflow_executions(workflow_id, started_at)",
            "CREATE INDEX IF NOT EXISTS idx_records_data_type ON data_type_records(data_type_id, id)",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn execution_from_row(row: &SqliteRow) -> Result<WorkflowExecution, StoreError> {
        let status: String = row.get("status");
        let triggered_by: String = row.get("triggered_by");
        let started_at: String = row.get("started_at");
        let completed_at: Option<String> = row.get("completed_at");
        let total_records: i64 = row.get("total_records");
        let failed_records: i64 = row.get("failed_records");

        Ok(WorkflowExecution {
            id: row.get("id"),
            workflow_id: row.get("workflow_id"),
            status: parse_enum(&status)?,
            started_at: parse_timestamp(&started_at)?,
            completed_at: completed_at.as_deref().map(parse_timestamp).transpose()?,
            total_records: total_records.max(0) as u64,
            failed_records: failed_records.max(0) as u64,
            results: row.get("results"),
            triggered_by: parse_enum::<TriggeredBy>(&triggered_by)?,
            user_id: row.get("user_id"),
            error: row.get("error"),
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_enum<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    serde_json::from_value(Value::String(raw.to_string()))
        .map_err(|e| StoreError::Corrupt(format!("bad enum value '{raw}': {e}")))
}

#[async_trait]
impl WorkflowStore for SqliteWorkflowStore {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition)?))
            }
            None => Ok(None),
        }
    }

    async fn save_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let definition = serde_json::to_string(workflow)?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let rows = sqlx::query("SELECT definition FROM workflows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let definition: String = row.get("definition");
                serde_json::from_str(&definition).map_err(StoreError::from)
            })
            .collect()
    }

    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, status, started_at, completed_at, total_records,
                 failed_records, results, triggered_by, user_id, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.workflow_id)
        .bind(execution.status.as_str())
        .bind(execution.started_at.to_rfc3339())
        .bind(execution.completed_at.map(|ts| ts.to_rfc3339()))
        .bind(execution.total_records as i64)
        .bind(execution.failed_records as i64)
        .bind(&execution.results)
        .bind(execution.triggered_by.as_str())
        .bind(&execution.user_id)
        .bind(&execution.error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn update_execution(&self, id: &str, update: &ExecutionUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions SET
                status = ?, completed_at = ?, total_records = ?,
                failed_records = ?, results = ?, error = ?
            WHERE id = ?
            "#,
        )
        .bind(update.status.as_str())
        .bind(update.completed_at.map(|ts| ts.to_rfc3339()))
        .bind(update.total_records as i64)
        .bind(update.failed_records as i64)
        .bind(&update.results)
        .bind(&update.error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>, StoreError> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::execution_from_row).transpose()
    }

    async fn list_executions(&self, workflow_id: &str) -> Result<Vec<WorkflowExecution>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_executions WHERE workflow_id = ? ORDER BY started_at DESC",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::execution_from_row).collect()
    }

    async fn save_checkpoint(&self, workflow_id: &str, offsets: &OffsetMap) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(offsets)?;
        sqlx::query(
            r#"
            INSERT INTO workflow_checkpoints (workflow_id, offsets, updated_at)
            VALUES (?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(workflow_id) DO UPDATE SET
                offsets = excluded.offsets,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(workflow_id)
        .bind(&encoded)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_checkpoint(&self, workflow_id: &str) -> Result<Option<OffsetMap>, StoreError> {
        let row = sqlx::query("SELECT offsets FROM workflow_checkpoints WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let encoded: String = row.get("offsets");
                Ok(Some(serde_json::from_str(&encoded)?))
            }
            None => Ok(None),
        }
    }

    async fn record_hourly_stats(
        &self,
        workflow_id: &str,
        pipeline_id: &str,
        hour: DateTime<Utc>,
        records_processed: u64,
        records_failed: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_hourly_stats
                (workflow_id, pipeline_id, hour, records_processed, records_failed, samples)
            VALUES (?, ?, ?, ?, ?, 1)
            ON CONFLICT(workflow_id, pipeline_id, hour) DO UPDATE SET
                records_processed = records_processed + excluded.records_processed,
                records_failed = records_failed + excluded.records_failed,
                samples = samples + 1
            "#,
        )
        .bind(workflow_id)
        .bind(pipeline_id)
        .bind(hour.to_rfc3339())
        .bind(records_processed as i64)
        .bind(records_failed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn hourly_stats(&self, workflow_id: &str) -> Result<Vec<HourlyStats>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_hourly_stats WHERE workflow_id = ? ORDER BY hour, pipeline_id",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<HourlyStats, StoreError> {
                let hour: String = row.get("hour");
                let processed: i64 = row.get("records_processed");
                let failed: i64 = row.get("records_failed");
                let samples: i64 = row.get("samples");
                Ok(HourlyStats {
                    workflow_id: row.get("workflow_id"),
                    pipeline_id: row.get("pipeline_id"),
                    hour: parse_timestamp(&hour)?,
                    records_processed: processed.max(0) as u64,
                    records_failed: failed.max(0) as u64,
                    samples: samples.max(0) as u64,
                })
            })
            .collect()
    }
}

#[async_trait]
impl RecordStore for SqliteWorkflowStore {
    async fn read_records(
        &self,
        data_type_id: &str,
        after: Option<i64>,
        limit: usize,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, data FROM data_type_records WHERE data_type_id = ? AND id > ? ORDER BY id LIMIT ?",
        )
        .bind(data_type_id)
        .bind(after.unwrap_or(0))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StoredRecord, StoreError> {
                let data: String = row.get("data");
                Ok(StoredRecord {
                    offset: row.get("id"),
                    data: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    async fn append_records(&self, data_type_id: &str, records: &[Value]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query("INSERT INTO data_type_records (data_type_id, data) VALUES (?, ?)")
                .bind(data_type_id)
                .bind(serde_json::to_string(record)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(records.len() as u64)
    }
}
