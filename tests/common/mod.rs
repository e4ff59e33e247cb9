//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use conductor::channel::{
    Backplane, BackplaneError, ChannelConfig, MemoryBackplane, ResilientChannel, Subscription,
};
use conductor::dispatch::{CommandDispatcher, DispatcherConfig};
use conductor::runtime::{
    EngineConfig, ExecutionEngine, LocalPipelineRunner, PipelineOutcome, PipelineRunner, RunContext,
    RunnerError,
};
use conductor::workflow::{
    ExecutionMode, MemoryWorkflowStore, PipelineSpec, ScheduleSpec, ScheduleType, Workflow,
    WorkflowStatus, WorkflowType,
};

/// Backplane whose data commands can be made to fail while pings still succeed.
///
/// Command failures count against the circuit breaker without looking like a
/// lost connection.
#[derive(Debug, Default)]
pub struct FlakyBackplane {
    inner: MemoryBackplane,
    failing: AtomicBool,
    calls: AtomicU64,
}

impl FlakyBackplane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Data commands that reached the backplane (pings excluded)
    pub fn command_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), BackplaneError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            Err(BackplaneError::Command("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backplane for FlakyBackplane {
    async fn ping(&self) -> Result<(), BackplaneError> {
        self.inner.ping().await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), BackplaneError> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, BackplaneError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<u64, BackplaneError> {
        self.check()?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BackplaneError> {
        self.check()?;
        self.inner.subscribe(channel).await
    }
}

/// Runner that records every spec it runs, optionally holding each run
///
/// A source of `{"type": "panic"}` makes the run panic. With
/// `ignore_cancel` the hold sleeps through cancellation like a runner
/// stuck in a blocking call.
pub struct RecordingRunner {
    inner: LocalPipelineRunner,
    delay: Duration,
    ignore_cancel: bool,
    ran: Mutex<Vec<PipelineSpec>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl RecordingRunner {
    pub fn new(store: Arc<MemoryWorkflowStore>, delay: Duration) -> Self {
        Self {
            inner: LocalPipelineRunner::new(store),
            delay,
            ignore_cancel: false,
            ran: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    pub fn ran(&self) -> Vec<PipelineSpec> {
        self.ran.lock().clone()
    }

    pub fn ran_ids(&self) -> Vec<String> {
        self.ran.lock().iter().map(|spec| spec.id.clone()).collect()
    }

    /// Runs in flight right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Most runs ever in flight at once
    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    async fn hold(&self, ctx: &RunContext) -> Result<(), RunnerError> {
        if self.delay.is_zero() {
            return Ok(());
        }
        if self.ignore_cancel {
            tokio::time::sleep(self.delay).await;
            return Ok(());
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(RunnerError::Cancelled),
            _ = tokio::time::sleep(self.delay) => Ok(()),
        }
    }
}

/// Decrements the in-flight count even when the run is aborted
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PipelineRunner for RecordingRunner {
    async fn run(&self, spec: &PipelineSpec, ctx: &RunContext) -> Result<PipelineOutcome, RunnerError> {
        self.ran.lock().push(spec.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.active);

        if spec.source["type"] == "panic" {
            panic!("pipeline {} blew up", spec.id);
        }
        self.hold(ctx).await?;
        self.inner.run(spec, ctx).await
    }
}

/// Fully wired engine on top of in-process backends
pub struct Harness {
    pub store: Arc<MemoryWorkflowStore>,
    pub backplane: Arc<MemoryBackplane>,
    pub channel: Arc<ResilientChannel>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub runner: Arc<RecordingRunner>,
    pub engine: Arc<ExecutionEngine>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Duration::ZERO, fast_engine_config()).await
    }

    pub async fn with(runner_delay: Duration, engine_config: EngineConfig) -> Self {
        Self::build(runner_delay, false, engine_config).await
    }

    /// Engine whose runner keeps going after cancellation
    pub async fn ignoring_cancel(runner_delay: Duration, engine_config: EngineConfig) -> Self {
        Self::build(runner_delay, true, engine_config).await
    }

    async fn build(runner_delay: Duration, ignore_cancel: bool, engine_config: EngineConfig) -> Self {
        let store = Arc::new(MemoryWorkflowStore::new());
        let backplane = Arc::new(MemoryBackplane::new());
        let channel = ResilientChannel::connect(backplane.clone(), fast_channel_config()).await;
        let dispatcher = CommandDispatcher::new(Arc::clone(&channel), DispatcherConfig::default());
        let mut runner = RecordingRunner::new(Arc::clone(&store), runner_delay);
        if ignore_cancel {
            runner = runner.ignoring_cancel();
        }
        let runner = Arc::new(runner);
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            store.clone(),
            runner.clone(),
            Arc::clone(&dispatcher),
            engine_config,
        ));

        Self {
            store,
            backplane,
            channel,
            dispatcher,
            runner,
            engine,
        }
    }

    /// Wait until the workflow has no tracked execution
    pub async fn wait_idle(&self, workflow_id: &str) {
        wait_until(Duration::from_secs(5), || !self.engine.is_running(workflow_id)).await;
    }
}

pub fn fast_channel_config() -> ChannelConfig {
    ChannelConfig {
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(400),
        health_check_interval: Duration::from_millis(200),
        operation_timeout: Duration::from_millis(500),
        ..ChannelConfig::default()
    }
}

pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        tick_interval: Duration::from_millis(20),
        checkpoint_every_ticks: 2,
        stop_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

/// Poll `condition` every 10ms until it holds or `limit` elapses
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn pipeline(id: &str, name: &str) -> PipelineSpec {
    PipelineSpec::new(id, name)
}

pub fn inline_pipeline(id: &str, name: &str, records: Value) -> PipelineSpec {
    let mut spec = PipelineSpec::new(id, name);
    spec.source = json!({"type": "inline", "records": records});
    spec
}

pub fn child_of(mut spec: PipelineSpec, parent: &str) -> PipelineSpec {
    spec.parent_pipeline_id = Some(parent.to_string());
    spec
}

pub fn workflow(id: &str, workflow_type: WorkflowType, pipelines: Vec<PipelineSpec>) -> Workflow {
    Workflow {
        id: id.to_string(),
        name: format!("{} workflow", id),
        slug: id.to_string(),
        project_id: "test".to_string(),
        workflow_type,
        execution_mode: ExecutionMode::Dag,
        pipelines,
        schedule: ScheduleSpec::default(),
        status: WorkflowStatus::Idle,
        last_run_at: None,
        next_run_at: None,
    }
}

pub fn batch_workflow(id: &str, pipelines: Vec<PipelineSpec>) -> Workflow {
    workflow(id, WorkflowType::Batch, pipelines)
}

pub fn realtime_workflow(id: &str, pipelines: Vec<PipelineSpec>) -> Workflow {
    workflow(id, WorkflowType::Realtime, pipelines)
}

pub fn cron_workflow(id: &str, cron: &str, timezone: Option<&str>) -> Workflow {
    let mut workflow = batch_workflow(id, vec![inline_pipeline("p", "P", json!([{"n": 1}]))]);
    workflow.schedule = ScheduleSpec {
        enabled: true,
        schedule_type: ScheduleType::Cron,
        cron_expression: Some(cron.to_string()),
        timezone: timezone.map(str::to_string),
    };
    workflow
}
