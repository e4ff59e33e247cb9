/// Agent Command Dispatch
///
/// Publishes commands to execution agents over the resilient channel. A
/// command that cannot be delivered is parked in a bounded in-memory queue and
/// re-published when the channel reconnects; anything older than the age
/// ceiling is dropped. Execution broadcasts are fire-and-forget.

pub mod command;

pub use command::{
    agent_channel, metrics_key, AgentCommand, CommandType, ExecutionBroadcast, PendingCommand,
    BROADCAST_CHANNEL,
};

use crate::channel::{ChannelError, ConnectionState, ResilientChannel};
use crate::workflow::TriggeredBy;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// TTL of `pipeline:{id}:metrics` entries
pub const PIPELINE_METRICS_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub max_pending_age: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_pending_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Not delivered yet; the command will be retried on reconnect
    #[error("command {command_id} queued for retry: {reason}")]
    Queued { command_id: String, reason: String },

    #[error("broadcast failed: {0}")]
    Broadcast(#[source] ChannelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn is_queued(&self) -> bool {
        matches!(self, DispatchError::Queued { .. })
    }
}

/// Outcome of one pass over the retry queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub delivered: usize,
    pub expired: usize,
    pub remaining: usize,
}

pub struct CommandDispatcher {
    channel: Arc<ResilientChannel>,
    config: DispatcherConfig,
    pending: Mutex<VecDeque<PendingCommand>>,
    retrying: AtomicBool,
}

impl CommandDispatcher {
    /// Create the dispatcher and hook its retry pass onto channel reconnects
    pub fn new(channel: Arc<ResilientChannel>, config: DispatcherConfig) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            channel: Arc::clone(&channel),
            config,
            pending: Mutex::new(VecDeque::new()),
            retrying: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&dispatcher);
        channel.on_state_change(move |state| {
            if state != ConnectionState::Connected {
                return;
            }
            if let Some(dispatcher) = weak.upgrade() {
                tokio::spawn(async move {
                    dispatcher.retry_pending().await;
                });
            }
        });

        dispatcher
    }

    pub fn channel(&self) -> &Arc<ResilientChannel> {
        &self.channel
    }

    /// Publish a command to one agent, queueing it when delivery fails
    pub async fn send_command_to_agent(
        &self,
        agent_id: &str,
        command_type: CommandType,
        pipeline_id: &str,
        payload: Value,
    ) -> Result<(), DispatchError> {
        let command = AgentCommand::new(command_type, pipeline_id, payload);
        let message = serde_json::to_string(&command)?;

        match self.channel.publish(&agent_channel(agent_id), &message).await {
            Ok(receivers) => {
                tracing::debug!(
                    agent_id,
                    pipeline_id,
                    receivers,
                    "📤 Sent {:?} command",
                    command_type
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    "⚠️ Command {:?} for agent {} queued for retry: {}",
                    command_type,
                    agent_id,
                    e
                );
                let command_id = command.id.clone();
                self.enqueue(PendingCommand::new(agent_id, command));
                Err(DispatchError::Queued {
                    command_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Announce an execution start on the broadcast channel
    pub async fn publish_workflow_execution(
        &self,
        workflow_id: &str,
        execution_id: &str,
        triggered_by: TriggeredBy,
    ) -> Result<u64, DispatchError> {
        let broadcast = ExecutionBroadcast {
            workflow_id: workflow_id.to_string(),
            execution_id: execution_id.to_string(),
            triggered_by,
            timestamp: Utc::now(),
        };
        let message = serde_json::to_string(&broadcast)?;

        let receivers = self
            .channel
            .publish(BROADCAST_CHANNEL, &message)
            .await
            .map_err(DispatchError::Broadcast)?;
        tracing::info!("📣 Broadcast execution {} for workflow {}", execution_id, workflow_id);
        Ok(receivers)
    }

    /// Store the latest metrics for a pipeline under a short TTL
    pub async fn publish_pipeline_metrics(&self, pipeline_id: &str, metrics: &Value) -> Result<(), ChannelError> {
        self.channel
            .set_json(&metrics_key(pipeline_id), metrics, Some(PIPELINE_METRICS_TTL))
            .await
    }

    /// Queued commands, oldest first, after purging expired entries
    pub fn pending_commands(&self) -> Vec<PendingCommand> {
        let mut pending = self.pending.lock();
        self.purge_expired(&mut pending);
        pending.iter().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        self.purge_expired(&mut pending);
        pending.len()
    }

    /// Re-publish every queued command
    ///
    /// Runs automatically on every reconnect. Only one pass runs at a time; a
    /// concurrent call returns an empty report.
    pub async fn retry_pending(&self) -> RetryReport {
        if self.retrying.swap(true, Ordering::SeqCst) {
            return RetryReport::default();
        }

        let batch: Vec<PendingCommand> = self.pending.lock().drain(..).collect();
        let mut report = RetryReport::default();
        let mut kept = Vec::new();

        if !batch.is_empty() {
            tracing::info!("🔁 Retrying {} queued agent commands", batch.len());
        }

        for mut pending in batch {
            if pending.is_expired(self.config.max_pending_age) {
                tracing::warn!(
                    "🗑️ Dropping command {} for agent {}: older than {:?} after {} retries",
                    pending.command.id,
                    pending.agent_id,
                    self.config.max_pending_age,
                    pending.retries
                );
                report.expired += 1;
                continue;
            }

            let message = match serde_json::to_string(&pending.command) {
                Ok(message) => message,
                Err(e) => {
                    tracing::error!("❌ Dropping unserializable command {}: {}", pending.command.id, e);
                    continue;
                }
            };

            match self.channel.publish(&agent_channel(&pending.agent_id), &message).await {
                Ok(_) => {
                    tracing::debug!(
                        command_id = %pending.command.id,
                        agent_id = %pending.agent_id,
                        "Delivered queued command"
                    );
                    report.delivered += 1;
                }
                Err(e) => {
                    pending.retries += 1;
                    tracing::debug!(
                        command_id = %pending.command.id,
                        retries = pending.retries,
                        "Queued command still undeliverable: {}",
                        e
                    );
                    kept.push(pending);
                }
            }
        }

        {
            let mut pending = self.pending.lock();
            // commands queued during the pass stay behind the older ones
            for command in kept.into_iter().rev() {
                pending.push_front(command);
            }
            while pending.len() > self.config.queue_capacity.max(1) {
                if let Some(evicted) = pending.pop_front() {
                    tracing::warn!("⚠️ Retry queue full, evicted command {}", evicted.command.id);
                }
            }
            report.remaining = pending.len();
        }

        self.retrying.store(false, Ordering::SeqCst);
        if report.delivered > 0 || report.expired > 0 {
            tracing::info!(
                "✅ Retry pass: {} delivered, {} expired, {} remaining",
                report.delivered,
                report.expired,
                report.remaining
            );
        }
        report
    }

    fn enqueue(&self, command: PendingCommand) {
        let mut pending = self.pending.lock();
        self.purge_expired(&mut pending);
        while pending.len() >= self.config.queue_capacity.max(1) {
            if let Some(evicted) = pending.pop_front() {
                tracing::warn!("⚠️ Retry queue full, evicted command {}", evicted.command.id);
            }
        }
        pending.push_back(command);
    }

    fn purge_expired(&self, pending: &mut VecDeque<PendingCommand>) {
        let max_age = self.config.max_pending_age;
        let before = pending.len();
        pending.retain(|command| !command.is_expired(max_age));
        let dropped = before - pending.len();
        if dropped > 0 {
            tracing::warn!("🗑️ Dropped {} queued commands past the {:?} age ceiling", dropped, max_age);
        }
    }
}
