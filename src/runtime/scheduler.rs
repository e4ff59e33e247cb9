/// Background cron scheduler service
///
/// Holds one tokio-cron-scheduler job per enabled workflow schedule. A firing
/// job re-reads its workflow, removes itself if the schedule was disabled in
/// the meantime, skips workflows that are still running, and otherwise starts
/// an execution through the engine.

use crate::runtime::engine::{EngineError, ExecutionEngine};
use crate::workflow::{StoreError, TriggeredBy, Workflow, WorkflowStatus, WorkflowStore, WorkflowType};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::{collections::HashMap, str::FromStr};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {0} is not a batch workflow")]
    NotBatch(String),

    #[error("workflow {0} is already running")]
    AlreadyRunning(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Engine(EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<EngineError> for SchedulerError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::AlreadyRunning(id) => SchedulerError::AlreadyRunning(id),
            EngineError::NotFound(id) => SchedulerError::NotFound(id),
            other => SchedulerError::Engine(other),
        }
    }
}

/// Registered timer of one workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub workflow_id: String,
    /// Normalized six-field expression
    pub cron_expression: String,
    pub timezone: String,
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Result of a manual or timer-driven trigger
#[derive(Debug, Clone, Serialize)]
pub struct TriggerOutcome {
    pub execution_id: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
struct ScheduledJob {
    job_id: Uuid,
    cron_expression: String,
    timezone: Tz,
}

/// Accept 5-field cron by prepending a zero seconds field
pub fn normalize_cron(expression: &str) -> Result<String, SchedulerError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(SchedulerError::InvalidCron {
            expression: expression.to_string(),
            reason: format!("expected 5 or 6 fields, found {}", n),
        }),
    }
}

/// Resolve an IANA timezone name, falling back to UTC
pub fn resolve_timezone(name: Option<&str>) -> Tz {
    match name.map(str::trim).filter(|name| !name.is_empty()) {
        None => Tz::UTC,
        Some(name) => Tz::from_str(name).unwrap_or_else(|_| {
            tracing::warn!("⚠️ Unknown timezone '{}', falling back to UTC", name);
            Tz::UTC
        }),
    }
}

pub struct SchedulerService {
    scheduler: Arc<RwLock<JobScheduler>>,
    jobs: Arc<RwLock<HashMap<String, ScheduledJob>>>,
    store: Arc<dyn WorkflowStore>,
    engine: Arc<ExecutionEngine>,
    me: Weak<SchedulerService>,
}

impl SchedulerService {
    pub async fn new(store: Arc<dyn WorkflowStore>, engine: Arc<ExecutionEngine>) -> Result<Arc<Self>, SchedulerError> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;

        Ok(Arc::new_cyclic(|me| Self {
            scheduler: Arc::new(RwLock::new(scheduler)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            store,
            engine,
            me: me.clone(),
        }))
    }

    /// Register every cron-scheduled workflow from the store and start ticking
    ///
    /// Workflows with invalid cron expressions are logged and skipped.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        tracing::info!("⏰ Starting cron scheduler service");

        let workflows = self.store.list_scheduled_workflows().await?;
        let total = workflows.len();
        let mut registered = 0;
        for workflow in workflows {
            match self.add_schedule(&workflow).await {
                Ok(Some(_)) => registered += 1,
                Ok(None) => {}
                Err(e) => tracing::error!("❌ Skipping schedule of workflow {}: {}", workflow.id, e),
            }
        }

        {
            let scheduler = self.scheduler.read().await;
            scheduler.start().await.map_err(scheduler_error)?;
        }

        tracing::info!("✅ Cron scheduler started with {}/{} schedules", registered, total);
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SchedulerError> {
        tracing::info!("⏹️ Stopping cron scheduler service");
        self.jobs.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler.shutdown().await.map_err(scheduler_error)?;
        tracing::info!("✅ Cron scheduler stopped");
        Ok(())
    }

    /// Register (or replace) the timer of `workflow`
    ///
    /// Returns `None` and drops any existing timer when the workflow has no
    /// enabled cron schedule.
    pub async fn add_schedule(&self, workflow: &Workflow) -> Result<Option<ScheduleInfo>, SchedulerError> {
        let Some(expression) = workflow
            .schedule
            .cron_expression
            .as_deref()
            .filter(|_| workflow.is_cron_scheduled())
        else {
            self.remove_schedule(&workflow.id).await;
            return Ok(None);
        };

        let cron_expression = normalize_cron(expression)?;
        let timezone = resolve_timezone(workflow.schedule.timezone.as_deref());
        let job = self.build_job(&workflow.id, &cron_expression, timezone)?;

        // held across remove, add and insert: one timer per workflow
        let mut jobs = self.jobs.write().await;
        if let Some(previous) = jobs.remove(&workflow.id) {
            self.remove_job(&workflow.id, previous.job_id).await;
        }
        let job_id = {
            let scheduler = self.scheduler.write().await;
            scheduler.add(job).await.map_err(scheduler_error)?
        };
        let replaced = jobs.insert(
            workflow.id.clone(),
            ScheduledJob {
                job_id,
                cron_expression: cron_expression.clone(),
                timezone,
            },
        );
        if let Some(replaced) = replaced {
            self.remove_job(&workflow.id, replaced.job_id).await;
        }
        drop(jobs);

        let next_run_at = self.next_run(job_id).await;
        if let Err(e) = self.store.set_run_times(&workflow.id, None, next_run_at).await {
            tracing::warn!("⚠️ Could not store next run of {}: {}", workflow.id, e);
        }

        tracing::info!(
            "⏰ Scheduled workflow {} with '{}' ({})",
            workflow.id,
            cron_expression,
            timezone.name()
        );
        Ok(Some(ScheduleInfo {
            workflow_id: workflow.id.clone(),
            cron_expression,
            timezone: timezone.name().to_string(),
            next_run_at,
        }))
    }

    /// Drop the timer of a workflow; returns false when none was registered
    pub async fn remove_schedule(&self, workflow_id: &str) -> bool {
        let Some(job) = self.jobs.write().await.remove(workflow_id) else {
            return false;
        };
        self.remove_job(workflow_id, job.job_id).await;
        tracing::info!("🗑️ Removed schedule of workflow {}", workflow_id);
        true
    }

    /// Replace the timer of `workflow`
    ///
    /// An invalid cron expression leaves the current timer in place.
    pub async fn update_schedule(&self, workflow: &Workflow) -> Result<Option<ScheduleInfo>, SchedulerError> {
        self.add_schedule(workflow).await
    }

    /// Start a batch workflow now, outside its schedule
    pub async fn trigger_now(&self, workflow_id: &str, user_id: Option<&str>) -> Result<TriggerOutcome, SchedulerError> {
        let workflow = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(workflow_id.to_string()))?;

        if workflow.workflow_type != WorkflowType::Batch {
            return Err(SchedulerError::NotBatch(workflow_id.to_string()));
        }
        if workflow.status == WorkflowStatus::Running || self.engine.is_running(workflow_id) {
            return Err(SchedulerError::AlreadyRunning(workflow_id.to_string()));
        }

        tracing::info!("🚀 Manual trigger of workflow {}", workflow_id);
        self.launch(&workflow, TriggeredBy::User, user_id).await
    }

    pub async fn get_schedule_info(&self, workflow_id: &str) -> Option<ScheduleInfo> {
        let job = self.jobs.read().await.get(workflow_id).cloned()?;
        Some(ScheduleInfo {
            workflow_id: workflow_id.to_string(),
            next_run_at: self.next_run(job.job_id).await,
            cron_expression: job.cron_expression,
            timezone: job.timezone.name().to_string(),
        })
    }

    /// Every registered timer, ordered by workflow id
    pub async fn list_active_schedules(&self) -> Vec<ScheduleInfo> {
        let jobs: Vec<(String, ScheduledJob)> = self
            .jobs
            .read()
            .await
            .iter()
            .map(|(id, job)| (id.clone(), job.clone()))
            .collect();

        let mut schedules = Vec::with_capacity(jobs.len());
        for (workflow_id, job) in jobs {
            schedules.push(ScheduleInfo {
                workflow_id,
                next_run_at: self.next_run(job.job_id).await,
                cron_expression: job.cron_expression,
                timezone: job.timezone.name().to_string(),
            });
        }
        schedules.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        schedules
    }

    async fn remove_job(&self, workflow_id: &str, job_id: Uuid) {
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&job_id).await {
            tracing::warn!("⚠️ Failed to remove cron job of {}: {:?}", workflow_id, e);
        }
    }

    fn build_job(&self, workflow_id: &str, cron_expression: &str, timezone: Tz) -> Result<Job, SchedulerError> {
        let service = self.me.clone();
        let workflow_id = workflow_id.to_string();

        Job::new_async_tz(cron_expression, timezone, move |_uuid, _l| {
            let service = service.clone();
            let workflow_id = workflow_id.clone();
            Box::pin(async move {
                if let Some(service) = service.upgrade() {
                    service.on_fire(&workflow_id).await;
                }
            })
        })
        .map_err(|e| SchedulerError::InvalidCron {
            expression: cron_expression.to_string(),
            reason: format!("{:?}", e),
        })
    }

    async fn on_fire(&self, workflow_id: &str) {
        tracing::debug!("🔔 Cron trigger fired for workflow {}", workflow_id);

        let workflow = match self.store.load_workflow(workflow_id).await {
            Ok(Some(workflow)) => workflow,
            Ok(None) => {
                tracing::info!("⏭️ Workflow {} no longer exists, dropping its schedule", workflow_id);
                self.remove_schedule(workflow_id).await;
                return;
            }
            Err(e) => {
                tracing::error!("❌ Could not load scheduled workflow {}: {}", workflow_id, e);
                return;
            }
        };

        if !workflow.is_cron_scheduled() {
            tracing::info!("⏭️ Schedule of {} was disabled, deregistering", workflow_id);
            self.remove_schedule(workflow_id).await;
            return;
        }
        if workflow.status == WorkflowStatus::Running || self.engine.is_running(workflow_id) {
            tracing::info!("⏭️ Workflow {} still running, skipping this firing", workflow_id);
            return;
        }

        match self.launch(&workflow, TriggeredBy::Schedule, None).await {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    tracing::warn!("⚠️ Scheduled run of {}: {}", workflow_id, warning);
                }
            }
            Err(SchedulerError::AlreadyRunning(_)) => {
                tracing::info!("⏭️ Workflow {} started elsewhere, skipping", workflow_id);
            }
            Err(e) => tracing::error!("❌ Scheduled run of {} failed to start: {}", workflow_id, e),
        }
    }

    async fn launch(
        &self,
        workflow: &Workflow,
        triggered_by: TriggeredBy,
        user_id: Option<&str>,
    ) -> Result<TriggerOutcome, SchedulerError> {
        let job_id = self.jobs.read().await.get(&workflow.id).map(|job| job.job_id);
        let next_run_at = match job_id {
            Some(job_id) => self.next_run(job_id).await,
            None => None,
        };

        let mut warnings = Vec::new();
        if let Err(e) = self
            .store
            .set_run_times(&workflow.id, Some(Utc::now()), next_run_at)
            .await
        {
            warnings.push(format!("run times not updated: {}", e));
        }

        let handle = self
            .engine
            .start_execution(&workflow.id, user_id, triggered_by)
            .await?;
        warnings.extend(handle.warnings);

        Ok(TriggerOutcome {
            execution_id: handle.execution_id,
            next_run_at,
            warnings,
        })
    }

    async fn next_run(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        let mut scheduler = self.scheduler.write().await;
        match scheduler.next_tick_for_job(job_id).await {
            Ok(next) => next,
            Err(e) => {
                tracing::debug!("Next tick unavailable for job {}: {:?}", job_id, e);
                None
            }
        }
    }
}

fn scheduler_error(error: tokio_cron_scheduler::JobSchedulerError) -> SchedulerError {
    SchedulerError::Scheduler(format!("{:?}", error))
}
