//! Integration tests for the execution engine.

mod common;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use common::{
    batch_workflow, child_of, fast_engine_config, inline_pipeline, pipeline, realtime_workflow, wait_until,
    Harness,
};
use conductor::channel::Backplane;
use conductor::dispatch::{agent_channel, AgentCommand, CommandType};
use conductor::runtime::{EngineConfig, EngineError};
use conductor::workflow::{
    ExecutionMode, ExecutionStatus, ExpansionMode, OffsetMap, ParameterBinding, PipelineSpec, RecordStore,
    TriggeredBy, WorkflowExecution, WorkflowStatus, WorkflowStore,
};

async fn finished_execution(harness: &Harness, workflow_id: &str, execution_id: &str) -> WorkflowExecution {
    harness.wait_idle(workflow_id).await;
    harness
        .store
        .get_execution(execution_id)
        .await
        .unwrap()
        .expect("execution recorded")
}

fn expanding_child(id: &str, name: &str, parent: &str) -> PipelineSpec {
    let mut spec = child_of(inline_pipeline(id, name, json!([])), parent);
    spec.expansion_mode = ExpansionMode::ForEachRecord;
    spec.parameter_bindings = vec![ParameterBinding {
        parent_field: "id".into(),
        child_param: "record_id".into(),
    }];
    spec
}

fn result_names(execution: &WorkflowExecution) -> Vec<String> {
    execution.pipeline_results().into_iter().map(|r| r.name).collect()
}

#[tokio::test]
async fn test_parent_and_dependencies_run_first() {
    let harness = Harness::new().await;

    let mut report = pipeline("report", "Report");
    report.depends_on = vec!["clean".into(), "audit".into()];
    let clean = child_of(pipeline("clean", "Clean"), "ingest");
    let audit = pipeline("audit", "Audit");
    let ingest = pipeline("ingest", "Ingest");
    harness
        .store
        .save_workflow(&batch_workflow("w", vec![report, clean, audit, ingest]))
        .await
        .unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);

    let ran = harness.runner.ran_ids();
    let position: HashMap<&str, usize> = ran.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    assert_eq!(ran.len(), 4);
    assert!(position["ingest"] < position["clean"]);
    assert!(position["clean"] < position["report"]);
    assert!(position["audit"] < position["report"]);

    let workflow = harness.store.load_workflow("w").await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

#[tokio::test]
async fn test_child_expands_per_parent_record() {
    let harness = Harness::new().await;
    let a = inline_pipeline("a", "A", json!([{"id": 1}, {"id": 2}]));
    let b = expanding_child("b", "B", "a");
    harness.store.save_workflow(&batch_workflow("w", vec![a, b])).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;

    assert_eq!(result_names(&execution), vec!["A", "B[0]", "B[1]"]);
    let ran = harness.runner.ran();
    let b0 = ran.iter().find(|spec| spec.id == "b_0").unwrap();
    let b1 = ran.iter().find(|spec| spec.id == "b_1").unwrap();
    assert_eq!(b0.source["record_id"], 1);
    assert_eq!(b1.source["record_id"], 2);
}

#[tokio::test]
async fn test_fan_out_matches_record_count() {
    let harness = Harness::new().await;
    let records: Vec<_> = (0..5).map(|i| json!({"id": format!("r{}", i)})).collect();
    let parent = inline_pipeline("src", "Source", json!(records));
    let child = expanding_child("each", "Each", "src");
    harness.store.save_workflow(&batch_workflow("w", vec![parent, child])).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;

    let results = execution.pipeline_results();
    assert_eq!(results.len(), 6);
    for (i, result) in results[1..].iter().enumerate() {
        assert_eq!(result.name, format!("Each[{}]", i));
        assert!(result.success);
    }
    let bound: Vec<_> = harness
        .runner
        .ran()
        .into_iter()
        .filter(|spec| spec.id.starts_with("each_"))
        .map(|spec| spec.source["record_id"].clone())
        .collect();
    assert_eq!(bound, records.iter().map(|r| r["id"].clone()).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_expansion_reads_parent_data_type_without_output() {
    let harness = Harness::new().await;
    harness
        .store
        .append_records("customers", &[json!({"id": 7}), json!({"id": 8}), json!({"id": 9})])
        .await
        .unwrap();

    // the parent emits nothing, so the child falls back to the parent's data type
    let mut parent = pipeline("load", "Load");
    parent.target_data_type_id = Some("customers".into());
    let child = expanding_child("enrich", "Enrich", "load");
    harness.store.save_workflow(&batch_workflow("w", vec![parent, child])).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;
    assert_eq!(result_names(&execution), vec!["Load", "Enrich[0]", "Enrich[1]", "Enrich[2]"]);
}

#[tokio::test]
async fn test_parallel_levels_complete_in_order() {
    let harness = Harness::new().await;
    let mut workflow = batch_workflow(
        "w",
        vec![
            inline_pipeline("a", "A", json!([{"n": 1}])),
            inline_pipeline("b", "B", json!([{"n": 2}, {"n": 3}])),
            child_of(pipeline("c", "C"), "a"),
        ],
    );
    workflow.execution_mode = ExecutionMode::Parallel;
    harness.store.save_workflow(&workflow).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(result_names(&execution), vec!["A", "B", "C"]);
    assert_eq!(execution.total_records, 3);
}

#[tokio::test]
async fn test_only_one_execution_per_workflow() {
    let harness = Harness::with(Duration::from_millis(200), fast_engine_config()).await;
    harness
        .store
        .save_workflow(&batch_workflow("w", vec![pipeline("p", "P")]))
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        harness.engine.start_execution("w", None, TriggeredBy::User),
        harness.engine.start_execution("w", None, TriggeredBy::Schedule),
    );
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(EngineError::AlreadyRunning(_))))
            .count(),
        1
    );
    assert_eq!(harness.engine.get_running_workflows(), vec!["w".to_string()]);

    harness.wait_idle("w").await;
    assert!(harness.engine.get_running_workflows().is_empty());
    assert_eq!(harness.store.list_executions("w").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cyclic_graph_is_not_started() {
    let harness = Harness::new().await;
    let a = child_of(pipeline("a", "A"), "b");
    let b = child_of(pipeline("b", "B"), "a");
    harness.store.save_workflow(&batch_workflow("w", vec![a, b])).await.unwrap();

    let err = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidGraph(_)));
    assert!(!harness.engine.is_running("w"));
    assert!(harness.store.list_executions("w").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_workflow_is_rejected() {
    let harness = Harness::new().await;
    assert!(matches!(
        harness.engine.start_execution("nope", None, TriggeredBy::User).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        harness.engine.stop_execution("nope").await,
        Err(EngineError::NotRunning(_))
    ));
}

#[tokio::test]
async fn test_realtime_offsets_survive_stop() {
    let harness = Harness::new().await;
    let events: Vec<_> = (1..=42).map(|n| json!({"n": n})).collect();
    harness.store.append_records("events", &events).await.unwrap();

    let mut p1 = pipeline("p1", "Events");
    p1.source = json!({"type": "data_type", "data_type_id": "events"});
    harness.store.save_workflow(&realtime_workflow("rt", vec![p1])).await.unwrap();

    let handle = harness.engine.start_execution("rt", None, TriggeredBy::User).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || harness.runner.ran_ids().len() >= 2).await);

    let outcome = harness.engine.stop_execution("rt").await.unwrap();
    let expected = OffsetMap::from([("p1".to_string(), 42)]);
    assert_eq!(outcome.offsets, Some(expected.clone()));
    assert!(!harness.engine.is_running("rt"));

    assert_eq!(harness.engine.load_offsets("rt").await, expected);
    assert_eq!(harness.store.load_checkpoint("rt").await.unwrap(), Some(expected));

    let execution = harness.store.get_execution(&handle.execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Stopped);
    assert_eq!(execution.total_records, 42);

    let stats = harness.store.hourly_stats("rt").await.unwrap();
    assert_eq!(stats.iter().map(|s| s.records_processed).sum::<u64>(), 42);
}

#[tokio::test]
async fn test_realtime_restart_resumes_from_checkpoint() {
    let harness = Harness::new().await;
    harness
        .store
        .append_records("events", &[json!({"n": 1}), json!({"n": 2})])
        .await
        .unwrap();
    let mut p1 = pipeline("p1", "Events");
    p1.source = json!({"type": "data_type", "data_type_id": "events"});
    harness.store.save_workflow(&realtime_workflow("rt", vec![p1])).await.unwrap();

    harness.engine.start_execution("rt", None, TriggeredBy::User).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || !harness.runner.ran_ids().is_empty()).await);
    harness.engine.stop_execution("rt").await.unwrap();

    harness
        .store
        .append_records("events", &[json!({"n": 3}), json!({"n": 4}), json!({"n": 5})])
        .await
        .unwrap();
    let runs_before = harness.runner.ran_ids().len();
    let handle = harness.engine.start_execution("rt", None, TriggeredBy::User).await.unwrap();
    assert!(wait_until(Duration::from_secs(5), || harness.runner.ran_ids().len() >= runs_before + 2).await);
    let outcome = harness.engine.stop_execution("rt").await.unwrap();

    assert_eq!(outcome.offsets.unwrap()["p1"], 5);
    let execution = harness.store.get_execution(&handle.execution_id).await.unwrap().unwrap();
    assert_eq!(execution.total_records, 3);
}

#[tokio::test]
async fn test_pause_holds_batch_until_resume() {
    let harness = Harness::with(Duration::from_millis(100), fast_engine_config()).await;
    let pipelines = vec![pipeline("a", "A"), pipeline("b", "B"), pipeline("c", "C")];
    let mut workflow = batch_workflow("w", pipelines);
    workflow.execution_mode = ExecutionMode::Sequential;
    harness.store.save_workflow(&workflow).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    harness.engine.pause_execution("w").await.unwrap();
    assert!(matches!(
        harness.engine.pause_execution("w").await,
        Err(EngineError::AlreadyPaused(_))
    ));
    assert_eq!(
        harness.store.load_workflow("w").await.unwrap().unwrap().status,
        WorkflowStatus::Paused
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(harness.runner.ran_ids().len() <= 1);
    assert!(harness.engine.is_running("w"));
    assert!(harness.engine.running_executions()[0].paused);

    harness.engine.resume_execution("w").await.unwrap();
    assert!(matches!(
        harness.engine.resume_execution("w").await,
        Err(EngineError::NotPaused(_))
    ));

    let execution = finished_execution(&harness, "w", &handle.execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(harness.runner.ran_ids(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_stopping_batch_marks_execution_stopped() {
    let harness = Harness::with(Duration::from_millis(200), fast_engine_config()).await;
    let pipelines = vec![pipeline("a", "A"), pipeline("b", "B")];
    harness.store.save_workflow(&batch_workflow("w", pipelines)).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let outcome = harness.engine.stop_execution("w").await.unwrap();
    assert_eq!(outcome.execution_id, handle.execution_id);
    assert!(outcome.offsets.is_none());

    let execution = harness.store.get_execution(&handle.execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, ExecutionStatus::Stopped);
    assert!(harness.runner.ran_ids().len() < 2);
    assert_eq!(
        harness.store.load_workflow("w").await.unwrap().unwrap().status,
        WorkflowStatus::Stopped
    );
}

#[tokio::test]
async fn test_stop_aborts_run_that_ignores_cancellation() {
    let config = EngineConfig {
        stop_timeout: Duration::from_millis(50),
        ..fast_engine_config()
    };
    let harness = Harness::ignoring_cancel(Duration::from_millis(400), config).await;
    harness
        .store
        .save_workflow(&batch_workflow("w", vec![pipeline("a", "A")]))
        .await
        .unwrap();

    let first = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    assert!(wait_until(Duration::from_secs(1), || harness.runner.active() == 1).await);

    let outcome = harness.engine.stop_execution("w").await.unwrap();
    assert!(!outcome.warnings.is_empty());
    assert_eq!(harness.runner.active(), 0);
    assert!(!harness.engine.is_running("w"));

    let second = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &second.execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(harness.runner.peak_active(), 1);

    let stopped = harness.store.get_execution(&first.execution_id).await.unwrap().unwrap();
    assert_eq!(stopped.status, ExecutionStatus::Stopped);
    assert_eq!(
        harness.store.load_workflow("w").await.unwrap().unwrap().status,
        WorkflowStatus::Completed
    );
}

#[tokio::test]
async fn test_failed_pipeline_does_not_abort_batch() {
    let harness = Harness::new().await;
    let mut broken = pipeline("b", "B");
    broken.source = json!({"type": "ftp"});
    let pipelines = vec![
        inline_pipeline("a", "A", json!([{"n": 1}])),
        broken,
        inline_pipeline("c", "C", json!([{"n": 2}])),
    ];
    let mut workflow = batch_workflow("w", pipelines);
    workflow.execution_mode = ExecutionMode::Sequential;
    harness.store.save_workflow(&workflow).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(harness.runner.ran_ids(), vec!["a", "b", "c"]);
    assert_eq!(execution.total_records, 2);
    assert_eq!(execution.failed_records, 1);

    let results = execution.pipeline_results();
    assert!(!results[1].success);
    assert!(results[1].error.is_some());
    assert!(results[2].success);
}

#[tokio::test]
async fn test_panicking_run_is_recorded_as_error() {
    let harness = Harness::new().await;
    let mut exploding = pipeline("x", "X");
    exploding.source = json!({"type": "panic"});
    harness.store.save_workflow(&batch_workflow("w", vec![exploding])).await.unwrap();

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    let execution = finished_execution(&harness, "w", &handle.execution_id).await;

    assert_eq!(execution.status, ExecutionStatus::Error);
    assert!(execution.error.unwrap().contains("panicked"));
    assert_eq!(
        harness.store.load_workflow("w").await.unwrap().unwrap().status,
        WorkflowStatus::Error
    );
}

#[tokio::test]
async fn test_assigned_agents_receive_lifecycle_commands() {
    let harness = Harness::new().await;
    let mut messages = harness.backplane.subscribe(&agent_channel("agent-7")).await.unwrap();

    let mut p1 = inline_pipeline("p1", "P1", json!([]));
    p1.agent_id = Some("agent-7".into());
    harness.store.save_workflow(&realtime_workflow("rt", vec![p1])).await.unwrap();

    let handle = harness.engine.start_execution("rt", None, TriggeredBy::User).await.unwrap();
    assert!(handle.warnings.is_empty());
    harness.engine.stop_execution("rt").await.unwrap();

    let mut received = Vec::new();
    for _ in 0..2 {
        let command: AgentCommand = serde_json::from_str(&messages.recv().await.unwrap()).unwrap();
        assert_eq!(command.pipeline_id, "p1");
        received.push(command.command_type);
    }
    assert_eq!(received, vec![CommandType::Start, CommandType::Stop]);
}

#[tokio::test]
async fn test_start_survives_backplane_outage_with_warnings() {
    let harness = Harness::new().await;
    let mut p = inline_pipeline("p", "P", json!([{"n": 1}]));
    p.agent_id = Some("agent-1".into());
    harness.store.save_workflow(&batch_workflow("w", vec![p])).await.unwrap();
    harness.backplane.set_online(false);

    let handle = harness.engine.start_execution("w", None, TriggeredBy::User).await.unwrap();
    assert!(!handle.warnings.is_empty());

    let execution = finished_execution(&harness, "w", &handle.execution_id).await;
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(harness.dispatcher.pending_count(), 1);
}
