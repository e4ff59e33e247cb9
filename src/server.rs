/// Server setup and initialization
///
/// Wires together all components: durable store, resilient channel, command
/// dispatcher, execution engine, cron scheduler, topic bridges and HTTP routes.

use crate::{
    api::{create_ops_routes, OpsState},
    bridge::{MemoryTopicAdmin, TopicBridgeManager},
    channel::{MemoryBackplane, ResilientChannel},
    config::Config,
    dispatch::CommandDispatcher,
    runtime::{ExecutionEngine, LocalPipelineRunner, SchedulerService},
    workflow::{SqliteWorkflowStore, WorkflowStore},
};
use anyhow::{Context, Result};
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Long-lived handles of a running daemon
#[derive(Clone)]
pub struct AppComponents {
    pub store: Arc<SqliteWorkflowStore>,
    pub channel: Arc<ResilientChannel>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub engine: Arc<ExecutionEngine>,
    pub scheduler: Arc<SchedulerService>,
    pub bridges: Arc<TopicBridgeManager>,
}

/// Create every component and the Axum router on top of them
pub async fn create_app(config: Config) -> Result<(Router, AppComponents)> {
    ensure_database_dir(&config.database.url)?;

    tracing::info!("📋 Opening workflow store at {}", config.database.url);
    let store = Arc::new(
        SqliteWorkflowStore::connect(&config.database.url)
            .await
            .context("Failed to open workflow store")?,
    );

    // The in-process backplane stands in for the shared broker until one is configured
    tracing::info!("📡 Connecting resilient channel");
    let channel = ResilientChannel::connect(Arc::new(MemoryBackplane::new()), config.channel.clone()).await;

    tracing::info!("📨 Initializing command dispatcher");
    let dispatcher = CommandDispatcher::new(Arc::clone(&channel), config.dispatcher.clone());

    tracing::info!("🚀 Initializing execution engine");
    let runner = Arc::new(LocalPipelineRunner::new(store.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        store.clone(),
        store.clone(),
        runner,
        Arc::clone(&dispatcher),
        config.engine.clone(),
    ));

    tracing::info!("🌉 Reconciling topic bridges");
    let bridges = Arc::new(TopicBridgeManager::new(Arc::new(MemoryTopicAdmin::new()), config.bridge.clone()));
    reconcile_bridges(store.as_ref(), &bridges).await;

    tracing::info!("⏰ Initializing cron scheduler service");
    let scheduler = SchedulerService::new(store.clone(), Arc::clone(&engine))
        .await
        .context("Failed to initialize cron scheduler")?;
    scheduler.start().await.context("Failed to start cron scheduler")?;

    let app = create_ops_routes().with_state(OpsState {
        channel: Arc::clone(&channel),
        engine: Arc::clone(&engine),
        scheduler: Arc::clone(&scheduler),
    });

    tracing::info!("✅ Application initialized successfully");
    Ok((
        app,
        AppComponents {
            store,
            channel,
            dispatcher,
            engine,
            scheduler,
            bridges,
        },
    ))
}

/// Start the HTTP server with the given configuration
///
/// Runs until Ctrl-C, then stops running executions, the scheduler and the
/// channel in that order.
pub async fn start_server(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting conductor...");

    let (app, components) = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    shutdown(&components).await;
    Ok(())
}

async fn shutdown(components: &AppComponents) {
    tracing::info!("🛑 Shutting down");
    for workflow_id in components.engine.get_running_workflows() {
        if let Err(e) = components.engine.stop_execution(&workflow_id).await {
            tracing::warn!("⚠️ Could not stop {}: {}", workflow_id, e);
        }
    }
    if let Err(e) = components.scheduler.stop().await {
        tracing::warn!("⚠️ Scheduler shutdown failed: {}", e);
    }
    components.channel.close();
}

/// Re-apply the bridge of every stored workflow that has parent/child edges
///
/// Topics missing on the broker are created and bridge sources/sinks are
/// written back when they drifted.
async fn reconcile_bridges(store: &dyn WorkflowStore, bridges: &TopicBridgeManager) {
    let workflows = match store.list_workflows().await {
        Ok(workflows) => workflows,
        Err(e) => {
            tracing::error!("❌ Could not list workflows for bridge reconciliation: {}", e);
            return;
        }
    };

    for mut workflow in workflows {
        if workflow.pipelines.iter().all(|spec| spec.parent().is_none()) {
            continue;
        }
        let applied = bridges
            .apply(workflow.topic_slug(), &[], &workflow.pipelines)
            .await;
        match applied {
            Ok(pipelines) if pipelines != workflow.pipelines => {
                workflow.pipelines = pipelines;
                if let Err(e) = store.save_workflow(&workflow).await {
                    tracing::warn!("⚠️ Could not save bridged workflow {}: {}", workflow.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("⚠️ Bridge of workflow {} not applied: {}", workflow.id, e),
        }
    }
}

fn ensure_database_dir(url: &str) -> Result<()> {
    let Some(path) = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:")) else {
        return Ok(());
    };
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() || path == ":memory:" {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring data directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
    }
    Ok(())
}
