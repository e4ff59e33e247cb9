/// Topic Bridge Management
///
/// Keeps intermediate streaming topics in step with the parent/child edges of
/// a workflow's pipeline graph. New edges get a topic, a bridge sink on the
/// parent and a bridge source on the child; retired edges lose their topic
/// (deleted in the background) and their parent sink. An edge that comes back
/// waits for its topic's pending delete before the topic is recreated.

pub mod admin;
pub mod naming;

pub use admin::{AdminError, MemoryTopicAdmin, TopicAdmin, TopicSpec};

use crate::workflow::PipelineSpec;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub partitions: u32,
    pub replication_factor: u16,
    pub retention: Duration,
    pub max_topic_name_len: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            replication_factor: 1,
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_topic_name_len: 249,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("pipeline {child} references unknown parent {parent}")]
    UnknownParent { child: String, parent: String },

    #[error("failed to create topic {topic}: {source}")]
    CreateTopic {
        topic: String,
        #[source]
        source: AdminError,
    },
}

/// Background topic deletions keyed by topic name, tagged with a sequence number
type PendingDeletes = Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>;

pub struct TopicBridgeManager {
    admin: Arc<dyn TopicAdmin>,
    config: BridgeConfig,
    pending_deletes: PendingDeletes,
    delete_seq: AtomicU64,
}

impl TopicBridgeManager {
    pub fn new(admin: Arc<dyn TopicAdmin>, config: BridgeConfig) -> Self {
        Self {
            admin,
            config,
            pending_deletes: Arc::new(Mutex::new(HashMap::new())),
            delete_seq: AtomicU64::new(0),
        }
    }

    pub fn topic_for(&self, workflow_slug: &str, parent_id: &str, child_id: &str) -> String {
        naming::topic_name(workflow_slug, parent_id, child_id, self.config.max_topic_name_len)
    }

    /// Rewire `new_specs` for the parent edges that changed since `old_specs`
    ///
    /// Returns the updated spec list. Topic creation failures abort the call;
    /// topic deletion is best-effort and only logged.
    pub async fn apply(
        &self,
        workflow_slug: &str,
        old_specs: &[PipelineSpec],
        new_specs: &[PipelineSpec],
    ) -> Result<Vec<PipelineSpec>, BridgeError> {
        let mut specs = new_specs.to_vec();
        let index: HashMap<String, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.id.clone(), i))
            .collect();

        for spec in &specs {
            if let Some(parent) = spec.parent() {
                if !index.contains_key(parent) {
                    return Err(BridgeError::UnknownParent {
                        child: spec.id.clone(),
                        parent: parent.to_string(),
                    });
                }
            }
        }

        let old_parents: HashMap<&str, &str> = old_specs
            .iter()
            .filter_map(|spec| spec.parent().map(|parent| (spec.id.as_str(), parent)))
            .collect();
        let new_parents: HashMap<String, String> = specs
            .iter()
            .filter_map(|spec| spec.parent().map(|parent| (spec.id.clone(), parent.to_string())))
            .collect();

        // retired edges
        for (child, old_parent) in &old_parents {
            if new_parents.get(*child).map(String::as_str) == Some(*old_parent) {
                continue;
            }
            let topic = self.topic_for(workflow_slug, old_parent, child);
            tracing::info!("🗑️ Retiring bridge topic {} ({} -> {})", topic, old_parent, child);

            if let Some(&i) = index.get(*old_parent) {
                remove_bridge_sink(&mut specs[i], &topic);
            }
            if let Some(&i) = index.get(*child) {
                if is_bridge_source(&specs[i].source, &topic) {
                    specs[i].source = Value::Null;
                }
            }
            self.delete_in_background(topic);
        }

        // new or re-parented edges
        for (child, parent) in &new_parents {
            if old_parents.get(child.as_str()) == Some(&parent.as_str()) {
                continue;
            }
            let topic = self.topic_for(workflow_slug, parent, child);
            self.ensure_topic(&topic).await?;

            let parent_spec = &mut specs[index[parent]];
            if !parent_spec.sinks.iter().any(|sink| is_bridge_sink(sink, &topic)) {
                parent_spec.sinks.push(json!({
                    "type": "topic",
                    "topic": topic,
                    "bridge": true,
                }));
            }

            specs[index[child]].source = json!({
                "type": "topic",
                "topic": topic,
                "consumer_group": naming::consumer_group(&topic),
                "bridge": true,
            });
            tracing::info!("🌉 Bridged {} -> {} via topic {}", parent, child, topic);
        }

        Ok(specs)
    }

    async fn ensure_topic(&self, topic: &str) -> Result<(), BridgeError> {
        // a retired edge may be coming back before its topic is gone
        let pending = self.pending_deletes.lock().remove(topic);
        if let Some((_, delete)) = pending {
            tracing::debug!(topic, "Waiting for pending delete before re-bridging");
            if let Err(e) = delete.await {
                tracing::warn!("⚠️ Delete task for topic {} failed: {}", topic, e);
            }
        }

        let exists = self
            .admin
            .topic_exists(topic)
            .await
            .map_err(|source| BridgeError::CreateTopic {
                topic: topic.to_string(),
                source,
            })?;
        if exists {
            tracing::debug!(topic, "Bridge topic already exists");
            return Ok(());
        }

        let spec = TopicSpec {
            name: topic.to_string(),
            partitions: self.config.partitions,
            replication_factor: self.config.replication_factor,
            retention_ms: self.config.retention.as_millis() as i64,
        };
        match self.admin.create_topic(&spec).await {
            Ok(()) | Err(AdminError::AlreadyExists(_)) => Ok(()),
            Err(source) => Err(BridgeError::CreateTopic {
                topic: topic.to_string(),
                source,
            }),
        }
    }

    fn delete_in_background(&self, topic: String) {
        let admin = Arc::clone(&self.admin);
        let pending = Arc::clone(&self.pending_deletes);
        let seq = self.delete_seq.fetch_add(1, Ordering::Relaxed);

        // hold the map until the handle is in, so the task's cleanup can't run first
        let mut deletes = self.pending_deletes.lock();
        let handle = tokio::spawn({
            let topic = topic.clone();
            async move {
                match admin.delete_topic(&topic).await {
                    Ok(()) => tracing::debug!(topic = %topic, "Deleted bridge topic"),
                    Err(e) => tracing::warn!("⚠️ Failed to delete bridge topic {}: {}", topic, e),
                }
                let mut deletes = pending.lock();
                if deletes.get(&topic).is_some_and(|(current, _)| *current == seq) {
                    deletes.remove(&topic);
                }
            }
        });
        deletes.insert(topic, (seq, handle));
    }
}

fn is_bridge_sink(sink: &Value, topic: &str) -> bool {
    sink.get("type").and_then(Value::as_str) == Some("topic")
        && sink.get("topic").and_then(Value::as_str) == Some(topic)
}

fn is_bridge_source(source: &Value, topic: &str) -> bool {
    source.get("bridge").and_then(Value::as_bool) == Some(true)
        && source.get("topic").and_then(Value::as_str) == Some(topic)
}

fn remove_bridge_sink(spec: &mut PipelineSpec, topic: &str) {
    spec.sinks.retain(|sink| !is_bridge_sink(sink, topic));
}
