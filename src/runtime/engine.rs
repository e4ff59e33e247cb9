/// Hierarchical workflow execution engine
///
/// Orders a workflow's pipelines with petgraph and runs them as one of two
/// closed plans:
/// - Batch: topological order (or concurrent topological levels in parallel
///   mode), expanding `for_each_record` children per parent output record,
///   then marking the execution completed
/// - Realtime: a ticking poll loop that runs every pipeline once per tick,
///   tracks per-pipeline offsets, folds statistics into hourly buckets and
///   checkpoints offsets until stopped
///
/// Every tracked execution owns a cancellation token; Stop cancels it and
/// waits for the run to wind down before returning.

use crate::dispatch::{CommandDispatcher, CommandType};
use crate::runtime::executor::{PipelineOutcome, PipelineRunner, RunContext, RunnerError};
use crate::runtime::expansion;
use crate::runtime::registry::{ExecutionRegistry, RunningExecution, RunningSummary};
use crate::workflow::execution::hour_bucket;
use crate::workflow::{
    ExecutionMode, ExecutionStatus, ExecutionUpdate, GraphError, OffsetMap, PipelineGraph,
    PipelineResult, PipelineSpec, RecordStore, StoreError, TriggeredBy, Workflow,
    WorkflowExecution, WorkflowStatus, WorkflowStore, WorkflowType,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick_interval: Duration,
    /// Persist the whole offset map every this many realtime ticks
    pub checkpoint_every_ticks: u64,
    pub stop_timeout: Duration,
    /// Upper bound on records read from a data type for one expansion
    pub expansion_record_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            checkpoint_every_ticks: 12,
            stop_timeout: Duration::from_secs(30),
            expansion_record_limit: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow not found: {0}")]
    NotFound(String),

    #[error("workflow {0} is already running")]
    AlreadyRunning(String),

    #[error("workflow {0} is not running")]
    NotRunning(String),

    #[error("workflow {0} is already paused")]
    AlreadyPaused(String),

    #[error("workflow {0} is not paused")]
    NotPaused(String),

    #[error("invalid pipeline graph: {0}")]
    InvalidGraph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Accepted start of an execution
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionHandle {
    pub execution_id: String,
    pub workflow_id: String,
    pub kind: WorkflowType,
    /// Degraded dispatch (broadcast failed, agent commands queued)
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub execution_id: String,
    /// Offsets persisted by a realtime run
    pub offsets: Option<OffsetMap>,
    pub warnings: Vec<String>,
}

/// Key holding a realtime workflow's offset map on the backplane
pub fn offsets_key(workflow_id: &str) -> String {
    format!("workflow:{}:offsets", workflow_id)
}

pub fn checkpoint_key(pipeline_id: &str) -> String {
    format!("pipeline:{}:checkpoint", pipeline_id)
}

/// What a started execution will run
enum ExecutionPlan {
    Batch {
        graph: PipelineGraph,
        mode: ExecutionMode,
    },
    Realtime {
        graph: PipelineGraph,
    },
}

impl ExecutionPlan {
    fn for_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        let graph = PipelineGraph::build(&workflow.pipelines)?;
        Ok(match workflow.workflow_type {
            WorkflowType::Batch => ExecutionPlan::Batch {
                graph,
                mode: workflow.execution_mode,
            },
            WorkflowType::Realtime => ExecutionPlan::Realtime { graph },
        })
    }
}

enum RunOutcome {
    Completed(Vec<PipelineResult>),
    Stopped(Vec<PipelineResult>),
    Failed(String),
}

/// Everything one graph step needs besides the engine
struct StepInput {
    spec: PipelineSpec,
    has_children: bool,
    /// Non-empty output captured from the parent earlier in this run
    parent_output: Option<Vec<Value>>,
    parent_data_type: Option<String>,
}

impl StepInput {
    fn new(graph: &PipelineGraph, spec: &PipelineSpec, captured: &HashMap<String, Vec<Value>>) -> Self {
        let parent = spec.parent();
        Self {
            spec: spec.clone(),
            has_children: graph.has_children(&spec.id),
            parent_output: parent
                .and_then(|parent| captured.get(parent))
                .filter(|records| !records.is_empty())
                .cloned(),
            parent_data_type: parent
                .and_then(|parent| graph.get(parent))
                .and_then(|parent| parent.target_data_type_id.clone()),
        }
    }
}

/// Output of one graph step: results plus output captured for children
struct StepOutput {
    results: Vec<PipelineResult>,
    captured: Option<(String, Vec<Value>)>,
}

pub struct ExecutionEngine {
    store: Arc<dyn WorkflowStore>,
    records: Arc<dyn RecordStore>,
    runner: Arc<dyn PipelineRunner>,
    dispatcher: Arc<CommandDispatcher>,
    registry: ExecutionRegistry,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        records: Arc<dyn RecordStore>,
        runner: Arc<dyn PipelineRunner>,
        dispatcher: Arc<CommandDispatcher>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            records,
            runner,
            dispatcher,
            registry: ExecutionRegistry::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<CommandDispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.registry.contains(workflow_id)
    }

    pub fn get_running_workflows(&self) -> Vec<String> {
        self.registry.workflow_ids()
    }

    pub fn running_executions(&self) -> Vec<RunningSummary> {
        self.registry.summaries()
    }

    /// Start a workflow execution in the background
    ///
    /// Rejects unknown workflows, malformed pipeline graphs and workflows that
    /// already have a tracked execution. Dispatch problems do not fail the
    /// start; they come back as warnings on the handle.
    pub async fn start_execution(
        self: &Arc<Self>,
        workflow_id: &str,
        user_id: Option<&str>,
        triggered_by: TriggeredBy,
    ) -> Result<ExecutionHandle, EngineError> {
        let workflow = self
            .store
            .load_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;

        let plan = ExecutionPlan::for_workflow(&workflow).map_err(|e| {
            tracing::error!("❌ Refusing to start workflow {}: {}", workflow_id, e);
            EngineError::InvalidGraph(e)
        })?;

        let execution = WorkflowExecution::start(workflow_id, triggered_by, user_id.map(str::to_string));
        let agents: Vec<(String, String)> = workflow
            .pipelines
            .iter()
            .filter_map(|spec| spec.agent_id.clone().map(|agent| (agent, spec.id.clone())))
            .collect();
        let entry = Arc::new(RunningExecution::new(
            &execution.id,
            workflow_id,
            workflow.workflow_type,
            agents,
        ));

        if let Err(existing) = self.registry.try_insert(Arc::clone(&entry)) {
            tracing::warn!(
                "⚠️ Workflow {} already running as execution {}",
                workflow_id,
                existing.execution_id
            );
            return Err(EngineError::AlreadyRunning(workflow_id.to_string()));
        }

        if let Err(e) = self.store.create_execution(&execution).await {
            self.registry.remove(workflow_id, &execution.id);
            return Err(e.into());
        }

        let mut warnings = Vec::new();
        if let Err(e) = self
            .store
            .set_workflow_status(workflow_id, WorkflowStatus::Running)
            .await
        {
            tracing::warn!("⚠️ Could not mark workflow {} running: {}", workflow_id, e);
            warnings.push(format!("workflow status not updated: {}", e));
        }

        if let Err(e) = self
            .dispatcher
            .publish_workflow_execution(workflow_id, &execution.id, triggered_by)
            .await
        {
            tracing::warn!("⚠️ Execution broadcast for {} failed: {}", workflow_id, e);
            warnings.push(format!("execution broadcast failed: {}", e));
        }
        warnings.extend(self.notify_agents(&entry, CommandType::Start).await);

        tracing::info!(
            "🚀 Started {:?} execution {} for workflow {} ({:?})",
            workflow.workflow_type,
            execution.id,
            workflow_id,
            triggered_by
        );

        let run = {
            let engine = Arc::clone(self);
            let entry = Arc::clone(&entry);
            tokio::spawn(async move {
                match plan {
                    ExecutionPlan::Batch { graph, mode } => engine.run_batch(&entry, &graph, mode).await,
                    ExecutionPlan::Realtime { graph } => engine.run_realtime(&entry, &graph).await,
                }
            })
        };
        let abort = run.abort_handle();
        let engine = Arc::clone(self);
        let task_entry = Arc::clone(&entry);
        let supervisor = tokio::spawn(async move {
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => {
                    tracing::warn!("⚠️ Execution {} aborted", task_entry.execution_id);
                    RunOutcome::Stopped(Vec::new())
                }
                Err(e) => {
                    tracing::error!("❌ Execution {} panicked: {}", task_entry.execution_id, e);
                    RunOutcome::Failed(format!("execution task panicked: {}", e))
                }
            };
            engine.finish(&task_entry, outcome).await;
        });
        entry.attach_task(supervisor, abort);

        Ok(ExecutionHandle {
            execution_id: execution.id,
            workflow_id: workflow_id.to_string(),
            kind: workflow.workflow_type,
            warnings,
        })
    }

    /// Cancel a running execution and wait for it to wind down
    pub async fn stop_execution(&self, workflow_id: &str) -> Result<StopOutcome, EngineError> {
        let entry = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotRunning(workflow_id.to_string()))?;

        tracing::info!("⏹️ Stopping execution {} of workflow {}", entry.execution_id, workflow_id);
        entry.cancel();
        let mut warnings = self.notify_agents(&entry, CommandType::Stop).await;

        if let Some(mut supervisor) = entry.take_task() {
            if tokio::time::timeout(self.config.stop_timeout, &mut supervisor).await.is_err() {
                tracing::warn!(
                    "⚠️ Execution {} did not stop within {:?}, aborting",
                    entry.execution_id,
                    self.config.stop_timeout
                );
                warnings.push(format!("execution aborted after {:?}", self.config.stop_timeout));
                entry.abort_run();
                if let Err(e) = supervisor.await {
                    tracing::error!("❌ Execution supervisor for {} failed: {}", workflow_id, e);
                }
                if entry.kind == WorkflowType::Realtime {
                    warnings.extend(self.persist_offsets(workflow_id, &entry.offsets()).await);
                }
            }
            // no-op unless the supervisor itself died before recording the outcome
            self.finish(&entry, RunOutcome::Stopped(Vec::new())).await;
        }

        let offsets = (entry.kind == WorkflowType::Realtime).then(|| entry.offsets());
        Ok(StopOutcome {
            execution_id: entry.execution_id.clone(),
            offsets,
            warnings,
        })
    }

    /// Hold a running execution at its next step boundary or tick
    pub async fn pause_execution(&self, workflow_id: &str) -> Result<Vec<String>, EngineError> {
        let entry = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotRunning(workflow_id.to_string()))?;
        if entry.set_paused(true) {
            return Err(EngineError::AlreadyPaused(workflow_id.to_string()));
        }

        tracing::info!("⏸️ Pausing execution {} of workflow {}", entry.execution_id, workflow_id);
        let mut warnings = Vec::new();
        if let Err(e) = self
            .store
            .set_workflow_status(workflow_id, WorkflowStatus::Paused)
            .await
        {
            warnings.push(format!("workflow status not updated: {}", e));
        }
        if entry.kind == WorkflowType::Realtime {
            warnings.extend(self.persist_offsets(workflow_id, &entry.offsets()).await);
        }
        warnings.extend(self.notify_agents(&entry, CommandType::Pause).await);
        Ok(warnings)
    }

    pub async fn resume_execution(&self, workflow_id: &str) -> Result<Vec<String>, EngineError> {
        let entry = self
            .registry
            .get(workflow_id)
            .ok_or_else(|| EngineError::NotRunning(workflow_id.to_string()))?;
        if !entry.set_paused(false) {
            return Err(EngineError::NotPaused(workflow_id.to_string()));
        }

        tracing::info!("▶️ Resuming execution {} of workflow {}", entry.execution_id, workflow_id);
        let mut warnings = Vec::new();
        if let Err(e) = self
            .store
            .set_workflow_status(workflow_id, WorkflowStatus::Running)
            .await
        {
            warnings.push(format!("workflow status not updated: {}", e));
        }
        warnings.extend(self.notify_agents(&entry, CommandType::Resume).await);
        Ok(warnings)
    }

    /// Last checkpointed offsets: backplane copy first, then the durable store
    pub async fn load_offsets(&self, workflow_id: &str) -> OffsetMap {
        match self
            .dispatcher
            .channel()
            .get_json::<OffsetMap>(&offsets_key(workflow_id))
            .await
        {
            Ok(offsets) => return offsets,
            Err(e) => tracing::debug!(workflow_id, "No offsets on backplane: {}", e),
        }

        match self.store.load_checkpoint(workflow_id).await {
            Ok(Some(offsets)) => offsets,
            Ok(None) => OffsetMap::new(),
            Err(e) => {
                tracing::warn!("⚠️ Failed to load checkpoint for {}: {}", workflow_id, e);
                OffsetMap::new()
            }
        }
    }

    /// Write offsets to the backplane and the durable store, returning warnings
    async fn persist_offsets(&self, workflow_id: &str, offsets: &OffsetMap) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Err(e) = self
            .dispatcher
            .channel()
            .set_json(&offsets_key(workflow_id), offsets, None)
            .await
        {
            tracing::warn!("⚠️ Offsets for {} not written to backplane: {}", workflow_id, e);
            warnings.push(format!("offsets not written to backplane: {}", e));
        }
        if let Err(e) = self.store.save_checkpoint(workflow_id, offsets).await {
            tracing::warn!("⚠️ Durable checkpoint for {} failed: {}", workflow_id, e);
            warnings.push(format!("durable checkpoint failed: {}", e));
        }
        tracing::debug!(workflow_id, pipelines = offsets.len(), "Persisted offsets");
        warnings
    }

    async fn notify_agents(&self, entry: &RunningExecution, command_type: CommandType) -> Vec<String> {
        let mut warnings = Vec::new();
        for (agent_id, pipeline_id) in &entry.agents {
            let payload = json!({
                "workflow_id": entry.workflow_id,
                "execution_id": entry.execution_id,
            });
            if let Err(e) = self
                .dispatcher
                .send_command_to_agent(agent_id, command_type, pipeline_id, payload)
                .await
            {
                warnings.push(format!("{:?} command for agent {}: {}", command_type, agent_id, e));
            }
        }
        warnings
    }

    /// Record the terminal state of an execution and release its slot
    ///
    /// Only the first call per execution writes; later calls just make sure
    /// the registry slot is gone.
    async fn finish(&self, entry: &RunningExecution, outcome: RunOutcome) {
        if !entry.mark_finished() {
            self.registry.remove(&entry.workflow_id, &entry.execution_id);
            return;
        }

        let (update, workflow_status) = match outcome {
            RunOutcome::Completed(results) => (
                ExecutionUpdate::finished(ExecutionStatus::Completed, &results),
                WorkflowStatus::Completed,
            ),
            RunOutcome::Stopped(results) => (
                ExecutionUpdate::finished(ExecutionStatus::Stopped, &results),
                WorkflowStatus::Stopped,
            ),
            RunOutcome::Failed(error) => (
                ExecutionUpdate::finished(ExecutionStatus::Error, &[]).with_error(error),
                WorkflowStatus::Error,
            ),
        };

        if let Err(e) = self.store.update_execution(&entry.execution_id, &update).await {
            tracing::error!("❌ Failed to record outcome of execution {}: {}", entry.execution_id, e);
        }
        if let Err(e) = self
            .store
            .set_workflow_status(&entry.workflow_id, workflow_status)
            .await
        {
            tracing::error!("❌ Failed to update status of workflow {}: {}", entry.workflow_id, e);
        }
        self.registry.remove(&entry.workflow_id, &entry.execution_id);

        tracing::info!(
            "🎉 Execution {} finished as {} ({} records, {} failed)",
            entry.execution_id,
            update.status.as_str(),
            update.total_records,
            update.failed_records
        );
    }

    async fn run_batch(self: &Arc<Self>, entry: &Arc<RunningExecution>, graph: &PipelineGraph, mode: ExecutionMode) -> RunOutcome {
        let mut results = Vec::new();
        let mut captured: HashMap<String, Vec<Value>> = HashMap::new();

        match mode {
            ExecutionMode::Parallel => {
                for (level_num, level) in graph.levels().iter().enumerate() {
                    if !entry.wait_if_paused().await {
                        return RunOutcome::Stopped(Vec::new());
                    }
                    tracing::debug!("📍 Level {}: running {} pipelines concurrently", level_num, level.len());

                    let mut tasks = JoinSet::new();
                    for (position, spec) in level.iter().enumerate() {
                        let engine = Arc::clone(self);
                        let entry = Arc::clone(entry);
                        let input = StepInput::new(graph, spec, &captured);
                        tasks.spawn(async move {
                            let output = engine.run_step(&entry, input).await;
                            (position, output)
                        });
                    }

                    let mut outputs = Vec::with_capacity(level.len());
                    while let Some(joined) = tasks.join_next().await {
                        match joined {
                            Ok(output) => outputs.push(output),
                            Err(e) => tracing::error!("❌ Pipeline task panicked: {}", e),
                        }
                    }
                    outputs.sort_by_key(|(position, _)| *position);
                    for (_, output) in outputs {
                        results.extend(output.results);
                        if let Some((id, records)) = output.captured {
                            captured.insert(id, records);
                        }
                    }
                }
            }
            ExecutionMode::Sequential | ExecutionMode::Dag => {
                let total = graph.len();
                for (step, spec) in graph.ordered().iter().enumerate() {
                    if !entry.wait_if_paused().await {
                        return RunOutcome::Stopped(Vec::new());
                    }
                    tracing::info!("📍 Step {}/{}: pipeline '{}'", step + 1, total, spec.name);

                    let output = self.run_step(entry, StepInput::new(graph, spec, &captured)).await;
                    results.extend(output.results);
                    if let Some((id, records)) = output.captured {
                        captured.insert(id, records);
                    }
                }
            }
        }

        if entry.is_cancelled() {
            return RunOutcome::Stopped(Vec::new());
        }
        RunOutcome::Completed(results)
    }

    /// Run one pipeline of a batch, expanding it per record when configured
    async fn run_step(&self, entry: &RunningExecution, input: StepInput) -> StepOutput {
        let spec = &input.spec;
        if !spec.expands_per_record() {
            let (result, outcome) = self.run_pipeline(entry, spec).await;
            let captured = match outcome {
                Some(outcome) if input.has_children => Some((spec.id.clone(), outcome.output)),
                _ => None,
            };
            return StepOutput {
                results: vec![result],
                captured,
            };
        }

        let records = match input.parent_output {
            Some(records) => records,
            None => self.expansion_records(spec, input.parent_data_type.clone()).await,
        };
        tracing::info!("🔀 Expanding '{}' over {} records", spec.name, records.len());

        let mut results = Vec::with_capacity(records.len());
        for expanded in expansion::expand(spec, &records) {
            if entry.is_cancelled() {
                break;
            }
            for warning in &expanded.warnings {
                tracing::warn!("⚠️ {}", warning);
            }
            let (result, _) = self.run_pipeline(entry, &expanded.spec).await;
            results.push(result);
        }
        StepOutput {
            results,
            captured: None,
        }
    }

    /// Records for an expansion without captured parent output
    ///
    /// Reads the parent's target data type, falling back to the child's own.
    async fn expansion_records(&self, spec: &PipelineSpec, parent_data_type: Option<String>) -> Vec<Value> {
        let Some(data_type) = parent_data_type.or_else(|| spec.target_data_type_id.clone()) else {
            tracing::warn!("⚠️ No records to expand '{}': parent produced no output", spec.name);
            return Vec::new();
        };

        match self
            .records
            .read_records(&data_type, None, self.config.expansion_record_limit)
            .await
        {
            Ok(records) => records.into_iter().map(|record| record.data).collect(),
            Err(e) => {
                tracing::warn!("⚠️ Failed to read expansion records from {}: {}", data_type, e);
                Vec::new()
            }
        }
    }

    /// Run one pipeline once, converting failures into a failed result
    async fn run_pipeline(&self, entry: &RunningExecution, spec: &PipelineSpec) -> (PipelineResult, Option<PipelineOutcome>) {
        let ctx = RunContext {
            workflow_id: entry.workflow_id.clone(),
            execution_id: entry.execution_id.clone(),
            offset: None,
            cancel: entry.cancel_token().clone(),
        };
        let started = std::time::Instant::now();
        let run = self.runner.run(spec, &ctx).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match run {
            Ok(outcome) => {
                tracing::debug!(
                    "✅ Pipeline '{}' processed {} records ({} failed) in {}ms",
                    spec.name,
                    outcome.records_processed,
                    outcome.records_failed,
                    duration_ms
                );
                let result = PipelineResult {
                    pipeline_id: spec.id.clone(),
                    name: spec.name.clone(),
                    success: true,
                    records_processed: outcome.records_processed,
                    records_failed: outcome.records_failed,
                    duration_ms,
                    error: None,
                };
                (result, Some(outcome))
            }
            Err(e) => {
                tracing::error!("❌ Pipeline '{}' failed: {}", spec.name, e);
                let result = PipelineResult {
                    pipeline_id: spec.id.clone(),
                    name: spec.name.clone(),
                    success: false,
                    records_processed: 0,
                    // the whole run counts as one failed unit
                    records_failed: 1,
                    duration_ms,
                    error: Some(e.to_string()),
                };
                (result, None)
            }
        }
    }

    async fn run_realtime(&self, entry: &RunningExecution, graph: &PipelineGraph) -> RunOutcome {
        let workflow_id = entry.workflow_id.as_str();
        entry.replace_offsets(self.load_offsets(workflow_id).await);

        let mut totals: HashMap<String, PipelineResult> = HashMap::new();
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = entry.cancel_token().cancelled() => break,
                _ = interval.tick() => {}
            }
            if entry.is_paused() {
                tracing::debug!(workflow_id, "Realtime execution paused, skipping tick");
                continue;
            }

            ticks += 1;
            for spec in graph.ordered() {
                if entry.is_cancelled() {
                    break;
                }
                self.realtime_tick(entry, spec, &mut totals).await;
            }

            if ticks % self.config.checkpoint_every_ticks.max(1) == 0 {
                self.persist_offsets(workflow_id, &entry.offsets()).await;
            }
        }

        self.persist_offsets(workflow_id, &entry.offsets()).await;
        tracing::info!("⏹️ Realtime execution {} stopped after {} ticks", entry.execution_id, ticks);

        let results = graph
            .ordered()
            .iter()
            .filter_map(|spec| totals.remove(&spec.id))
            .collect();
        RunOutcome::Stopped(results)
    }

    async fn realtime_tick(
        &self,
        entry: &RunningExecution,
        spec: &PipelineSpec,
        totals: &mut HashMap<String, PipelineResult>,
    ) {
        let ctx = RunContext {
            workflow_id: entry.workflow_id.clone(),
            execution_id: entry.execution_id.clone(),
            offset: entry.offset(&spec.id),
            cancel: entry.cancel_token().clone(),
        };
        let total = totals.entry(spec.id.clone()).or_insert_with(|| PipelineResult {
            pipeline_id: spec.id.clone(),
            name: spec.name.clone(),
            success: true,
            records_processed: 0,
            records_failed: 0,
            duration_ms: 0,
            error: None,
        });

        let started = std::time::Instant::now();
        let outcome = match self.runner.run(spec, &ctx).await {
            Ok(outcome) => outcome,
            Err(RunnerError::Cancelled) => return,
            Err(e) => {
                tracing::warn!("⚠️ Realtime pipeline '{}' tick failed: {}", spec.name, e);
                total.success = false;
                total.error = Some(e.to_string());
                return;
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(offset) = outcome.offset {
            entry.set_offset(&spec.id, offset);
            if let Err(e) = self
                .dispatcher
                .channel()
                .set(&checkpoint_key(&spec.id), &offset.to_string(), None)
                .await
            {
                tracing::debug!(pipeline = %spec.id, "Checkpoint kept locally: {}", e);
            }
        }

        if let Err(e) = self
            .store
            .record_hourly_stats(
                &entry.workflow_id,
                &spec.id,
                hour_bucket(Utc::now()),
                outcome.records_processed,
                outcome.records_failed,
            )
            .await
        {
            tracing::warn!("⚠️ Failed to record hourly stats for '{}': {}", spec.name, e);
        }

        let metrics = json!({
            "workflow_id": entry.workflow_id,
            "execution_id": entry.execution_id,
            "records_processed": outcome.records_processed,
            "records_failed": outcome.records_failed,
            "offset": outcome.offset.or_else(|| entry.offset(&spec.id)),
            "duration_ms": duration_ms,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self.dispatcher.publish_pipeline_metrics(&spec.id, &metrics).await {
            tracing::debug!(pipeline = %spec.id, "Metrics kept locally: {}", e);
        }

        total.records_processed += outcome.records_processed;
        total.records_failed += outcome.records_failed;
        total.duration_ms += duration_ms;
    }
}
