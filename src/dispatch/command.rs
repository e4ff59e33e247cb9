/// Agent command messages and their retry-queue wrapper

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::workflow::TriggeredBy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Start,
    Stop,
    Pause,
    Resume,
    UpdateConfig,
}

/// Command published to a single execution agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCommand {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    pub pipeline_id: String,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl AgentCommand {
    pub fn new(command_type: CommandType, pipeline_id: &str, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command_type,
            pipeline_id: pipeline_id.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Command waiting in the dispatcher for the backplane to come back
#[derive(Debug, Clone, Serialize)]
pub struct PendingCommand {
    pub command: AgentCommand,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub retries: u32,
    #[serde(skip)]
    pub(crate) enqueued_at: Instant,
}

impl PendingCommand {
    pub fn new(agent_id: &str, command: AgentCommand) -> Self {
        Self {
            command,
            agent_id: agent_id.to_string(),
            created_at: Utc::now(),
            retries: 0,
            enqueued_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }

    pub fn is_expired(&self, max_age: Duration) -> bool {
        self.age() >= max_age
    }
}

/// Fire-and-forget notice that a workflow execution started
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionBroadcast {
    pub workflow_id: String,
    pub execution_id: String,
    pub triggered_by: TriggeredBy,
    pub timestamp: DateTime<Utc>,
}

pub fn agent_channel(agent_id: &str) -> String {
    format!("agent:commands:{}", agent_id)
}

pub const BROADCAST_CHANNEL: &str = "workflow:execute:broadcast";

pub fn metrics_key(pipeline_id: &str) -> String {
    format!("pipeline:{}:metrics", pipeline_id)
}
