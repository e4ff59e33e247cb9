/// Log broker admin seam
///
/// The bridge manager provisions intermediate topics through this trait.
/// `MemoryTopicAdmin` keeps topics in memory for standalone runs and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: u32,
    pub replication_factor: u16,
    pub retention_ms: i64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdminError {
    #[error("topic already exists: {0}")]
    AlreadyExists(String),

    #[error("topic not found: {0}")]
    NotFound(String),

    #[error("broker error: {0}")]
    Broker(String),
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError>;

    async fn delete_topic(&self, name: &str) -> Result<(), AdminError>;

    async fn topic_exists(&self, name: &str) -> Result<bool, AdminError>;
}

#[derive(Debug, Default)]
pub struct MemoryTopicAdmin {
    topics: Mutex<BTreeMap<String, TopicSpec>>,
    fail_deletes: AtomicBool,
}

impl MemoryTopicAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topics(&self) -> Vec<TopicSpec> {
        self.topics.lock().values().cloned().collect()
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.lock().keys().cloned().collect()
    }

    /// Make every subsequent delete fail with a broker error
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TopicAdmin for MemoryTopicAdmin {
    async fn create_topic(&self, spec: &TopicSpec) -> Result<(), AdminError> {
        let mut topics = self.topics.lock();
        if topics.contains_key(&spec.name) {
            return Err(AdminError::AlreadyExists(spec.name.clone()));
        }
        topics.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<(), AdminError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(AdminError::Broker("delete rejected".to_string()));
        }
        match self.topics.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(AdminError::NotFound(name.to_string())),
        }
    }

    async fn topic_exists(&self, name: &str) -> Result<bool, AdminError> {
        Ok(self.topics.lock().contains_key(name))
    }
}
