/// Registry of running executions using ArcSwap
///
/// Status queries vastly outnumber start/stop, so readers load the current
/// map without locking and writers swap in a new map. Insertion is atomic per
/// workflow id, which is what enforces one active execution per workflow.

use crate::workflow::{OffsetMap, WorkflowType};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

/// Live state of one tracked execution
#[derive(Debug)]
pub struct RunningExecution {
    pub execution_id: String,
    pub workflow_id: String,
    pub kind: WorkflowType,
    pub started_at: DateTime<Utc>,
    /// `(agent_id, pipeline_id)` pairs notified on lifecycle changes
    pub agents: Vec<(String, String)>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
    offsets: Mutex<OffsetMap>,
    task: Mutex<Option<JoinHandle<()>>>,
    run: Mutex<Option<AbortHandle>>,
    finished: AtomicBool,
}

impl RunningExecution {
    pub fn new(
        execution_id: &str,
        workflow_id: &str,
        kind: WorkflowType,
        agents: Vec<(String, String)>,
    ) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            kind,
            started_at: Utc::now(),
            agents,
            cancel: CancellationToken::new(),
            paused: watch::channel(false).0,
            offsets: Mutex::new(OffsetMap::new()),
            task: Mutex::new(None),
            run: Mutex::new(None),
            finished: AtomicBool::new(false),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Flip the pause gate; returns the previous value
    pub fn set_paused(&self, paused: bool) -> bool {
        self.paused.send_replace(paused)
    }

    /// Wait while paused; returns false once the execution is cancelled
    pub async fn wait_if_paused(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if !self.is_paused() {
            return true;
        }

        tracing::info!("⏸️ Execution {} paused at step boundary", self.execution_id);
        let mut gate = self.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            resumed = async { gate.wait_for(|paused| !*paused).await.is_ok() } => {
                resumed && !self.cancel.is_cancelled()
            }
        }
    }

    pub fn offsets(&self) -> OffsetMap {
        self.offsets.lock().clone()
    }

    pub fn offset(&self, pipeline_id: &str) -> Option<i64> {
        self.offsets.lock().get(pipeline_id).copied()
    }

    pub fn set_offset(&self, pipeline_id: &str, offset: i64) {
        self.offsets.lock().insert(pipeline_id.to_string(), offset);
    }

    pub fn replace_offsets(&self, offsets: OffsetMap) {
        *self.offsets.lock() = offsets;
    }

    /// Attach the supervising task and an abort handle for the run it awaits
    pub fn attach_task(&self, supervisor: JoinHandle<()>, run: AbortHandle) {
        *self.task.lock() = Some(supervisor);
        *self.run.lock() = Some(run);
    }

    pub fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().take()
    }

    /// Abort the run task at its next suspension point
    pub fn abort_run(&self) {
        if let Some(run) = self.run.lock().as_ref() {
            run.abort();
        }
    }

    /// Claim the single terminal transition; only the first caller gets true
    pub fn mark_finished(&self) -> bool {
        !self.finished.swap(true, Ordering::SeqCst)
    }

    pub fn summary(&self) -> RunningSummary {
        RunningSummary {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id.clone(),
            kind: self.kind,
            started_at: self.started_at,
            paused: self.is_paused(),
        }
    }
}

/// Serializable view of a tracked execution
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningSummary {
    pub workflow_id: String,
    pub execution_id: String,
    pub kind: WorkflowType,
    pub started_at: DateTime<Utc>,
    pub paused: bool,
}

/// Lock-free map of workflow id to its running execution
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    entries: ArcSwap<HashMap<String, Arc<RunningExecution>>>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `entry` unless its workflow already has a running execution
    ///
    /// Returns the execution already holding the slot on conflict.
    pub fn try_insert(&self, entry: Arc<RunningExecution>) -> Result<(), Arc<RunningExecution>> {
        let previous = self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.entry(entry.workflow_id.clone())
                .or_insert_with(|| Arc::clone(&entry));
            next
        });

        match previous.get(&entry.workflow_id) {
            Some(existing) => Err(Arc::clone(existing)),
            None => {
                tracing::debug!(
                    workflow_id = %entry.workflow_id,
                    execution_id = %entry.execution_id,
                    "Tracking execution"
                );
                Ok(())
            }
        }
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<RunningExecution>> {
        self.entries.load().get(workflow_id).cloned()
    }

    pub fn contains(&self, workflow_id: &str) -> bool {
        self.entries.load().contains_key(workflow_id)
    }

    /// Stop tracking `workflow_id` if it still belongs to `execution_id`
    pub fn remove(&self, workflow_id: &str, execution_id: &str) -> bool {
        let previous = self.entries.rcu(|current| {
            let mut next = HashMap::clone(current);
            if next
                .get(workflow_id)
                .is_some_and(|entry| entry.execution_id == execution_id)
            {
                next.remove(workflow_id);
            }
            next
        });
        previous
            .get(workflow_id)
            .is_some_and(|entry| entry.execution_id == execution_id)
    }

    /// Ids of every tracked workflow, sorted
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn summaries(&self) -> Vec<RunningSummary> {
        let mut summaries: Vec<RunningSummary> =
            self.entries.load().values().map(|entry| entry.summary()).collect();
        summaries.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        summaries
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(execution_id: &str, workflow_id: &str) -> Arc<RunningExecution> {
        Arc::new(RunningExecution::new(execution_id, workflow_id, WorkflowType::Batch, Vec::new()))
    }

    #[test]
    fn second_insert_for_same_workflow_conflicts() {
        let registry = ExecutionRegistry::new();
        assert!(registry.try_insert(entry("e1", "wf")).is_ok());

        let existing = registry.try_insert(entry("e2", "wf")).unwrap_err();
        assert_eq!(existing.execution_id, "e1");
        assert_eq!(registry.workflow_ids(), vec!["wf"]);
    }

    #[test]
    fn remove_ignores_stale_execution_ids() {
        let registry = ExecutionRegistry::new();
        registry.try_insert(entry("e1", "wf")).unwrap();

        assert!(!registry.remove("wf", "old"));
        assert!(registry.contains("wf"));
        assert!(registry.remove("wf", "e1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn terminal_transition_is_claimed_once() {
        let running = entry("e1", "wf");
        assert!(running.mark_finished());
        assert!(!running.mark_finished());
    }

    #[tokio::test]
    async fn pause_gate_releases_on_resume_or_cancel() {
        let running = entry("e1", "wf");
        running.set_paused(true);

        let waiter = {
            let running = Arc::clone(&running);
            tokio::spawn(async move { running.wait_if_paused().await })
        };
        tokio::task::yield_now().await;
        running.set_paused(false);
        assert!(waiter.await.unwrap());

        running.set_paused(true);
        let waiter = {
            let running = Arc::clone(&running);
            tokio::spawn(async move { running.wait_if_paused().await })
        };
        tokio::task::yield_now().await;
        running.cancel();
        assert!(!waiter.await.unwrap());
    }
}
