/// Operational REST API endpoints
///
/// Read-only views of the channel and the runtime plus lifecycle control of
/// executions. Workflow definitions are managed elsewhere; these routes only
/// act on what the store already holds.

use crate::{
    channel::{ChannelStatus, ConnectionState, ResilientChannel},
    runtime::{
        EngineError, ExecutionEngine, ExecutionHandle, RunningSummary, ScheduleInfo, SchedulerError,
        SchedulerService, StopOutcome, TriggerOutcome,
    },
    workflow::TriggeredBy,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared handles of the running daemon
#[derive(Clone)]
pub struct OpsState {
    pub channel: Arc<ResilientChannel>,
    pub engine: Arc<ExecutionEngine>,
    pub scheduler: Arc<SchedulerService>,
}

/// Optional body of trigger and start requests
#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    pub user_id: Option<String>,
}

pub fn create_ops_routes() -> Router<OpsState> {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics/channel", get(channel_metrics))
        .route("/executions/running", get(running_executions))
        .route("/schedules", get(list_schedules))
        .route("/schedules/{workflow_id}", get(get_schedule))
        .route("/workflows/{workflow_id}/trigger", post(trigger_workflow))
        .route("/workflows/{workflow_id}/start", post(start_workflow))
        .route("/workflows/{workflow_id}/stop", post(stop_workflow))
        .route("/workflows/{workflow_id}/pause", post(pause_workflow))
        .route("/workflows/{workflow_id}/resume", post(resume_workflow))
}

/// GET /healthz
///
/// Degraded (but still 200) while the backplane is unreachable, since
/// executions keep running on local state.
async fn health_check(State(state): State<OpsState>) -> Json<Value> {
    let connection = state.channel.state();
    Json(json!({
        "status": if connection == ConnectionState::Connected { "ok" } else { "degraded" },
        "connection": connection,
        "running_executions": state.engine.get_running_workflows().len(),
    }))
}

/// GET /metrics/channel
async fn channel_metrics(State(state): State<OpsState>) -> Json<ChannelStatus> {
    Json(state.channel.status())
}

/// GET /executions/running
async fn running_executions(State(state): State<OpsState>) -> Json<Vec<RunningSummary>> {
    Json(state.engine.running_executions())
}

/// GET /schedules
async fn list_schedules(State(state): State<OpsState>) -> Json<Vec<ScheduleInfo>> {
    Json(state.scheduler.list_active_schedules().await)
}

/// GET /schedules/:workflow_id
async fn get_schedule(
    State(state): State<OpsState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<ScheduleInfo>, StatusCode> {
    state
        .scheduler
        .get_schedule_info(&workflow_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// POST /workflows/:workflow_id/trigger
///
/// Runs a batch workflow now, outside its schedule.
async fn trigger_workflow(
    State(state): State<OpsState>,
    Path(workflow_id): Path<String>,
    body: Option<Json<TriggerRequest>>,
) -> Result<Json<TriggerOutcome>, StatusCode> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    match state.scheduler.trigger_now(&workflow_id, request.user_id.as_deref()).await {
        Ok(outcome) => {
            tracing::info!("🚀 Triggered workflow {} as {}", workflow_id, outcome.execution_id);
            Ok(Json(outcome))
        }
        Err(e) => {
            tracing::warn!("⚠️ Trigger of workflow {} rejected: {}", workflow_id, e);
            Err(scheduler_status(&e))
        }
    }
}

/// POST /workflows/:workflow_id/start
///
/// Starts any workflow kind, including realtime ones.
async fn start_workflow(
    State(state): State<OpsState>,
    Path(workflow_id): Path<String>,
    body: Option<Json<TriggerRequest>>,
) -> Result<Json<ExecutionHandle>, StatusCode> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    state
        .engine
        .start_execution(&workflow_id, request.user_id.as_deref(), TriggeredBy::User)
        .await
        .map(Json)
        .map_err(|e| engine_status(&workflow_id, &e))
}

/// POST /workflows/:workflow_id/stop
async fn stop_workflow(
    State(state): State<OpsState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<StopOutcome>, StatusCode> {
    state
        .engine
        .stop_execution(&workflow_id)
        .await
        .map(Json)
        .map_err(|e| engine_status(&workflow_id, &e))
}

/// POST /workflows/:workflow_id/pause
async fn pause_workflow(
    State(state): State<OpsState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let warnings = state
        .engine
        .pause_execution(&workflow_id)
        .await
        .map_err(|e| engine_status(&workflow_id, &e))?;
    Ok(Json(json!({ "workflow_id": workflow_id, "status": "paused", "warnings": warnings })))
}

/// POST /workflows/:workflow_id/resume
async fn resume_workflow(
    State(state): State<OpsState>,
    Path(workflow_id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let warnings = state
        .engine
        .resume_execution(&workflow_id)
        .await
        .map_err(|e| engine_status(&workflow_id, &e))?;
    Ok(Json(json!({ "workflow_id": workflow_id, "status": "running", "warnings": warnings })))
}

fn engine_status(workflow_id: &str, error: &EngineError) -> StatusCode {
    let status = match error {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AlreadyRunning(_)
        | EngineError::NotRunning(_)
        | EngineError::AlreadyPaused(_)
        | EngineError::NotPaused(_) => StatusCode::CONFLICT,
        EngineError::InvalidGraph(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ Lifecycle request for {} failed: {}", workflow_id, error);
    } else {
        tracing::debug!("Lifecycle request for {} rejected: {}", workflow_id, error);
    }
    status
}

fn scheduler_status(error: &SchedulerError) -> StatusCode {
    match error {
        SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SchedulerError::NotBatch(_) | SchedulerError::InvalidCron { .. } => StatusCode::BAD_REQUEST,
        SchedulerError::Engine(EngineError::InvalidGraph(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        SchedulerError::Engine(_) | SchedulerError::Store(_) | SchedulerError::Scheduler(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
