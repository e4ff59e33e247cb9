/// Conductor: control plane for distributed data pipelines
///
/// Main entry point of the daemon. Loads configuration from the environment
/// and starts the scheduler, the execution engine and the HTTP server.

use conductor::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Health check at /healthz
/// - Channel metrics at /metrics/channel
/// - Running executions at /executions/running
/// - Schedules at /schedules
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to 0.0.0.0:3004 and sqlite://data/conductor.db
    let config = Config::default();

    start_server(config).await
}
