//! Integration tests for topic bridges between parent and child pipelines.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use common::{child_of, pipeline, wait_until};
use conductor::bridge::{BridgeConfig, MemoryTopicAdmin, TopicBridgeManager};
use conductor::workflow::PipelineSpec;

fn manager() -> (Arc<MemoryTopicAdmin>, TopicBridgeManager) {
    let admin = Arc::new(MemoryTopicAdmin::new());
    let manager = TopicBridgeManager::new(admin.clone(), BridgeConfig::default());
    (admin, manager)
}

fn find<'a>(specs: &'a [PipelineSpec], id: &str) -> &'a PipelineSpec {
    specs.iter().find(|spec| spec.id == id).unwrap()
}

fn bridge_sinks(spec: &PipelineSpec) -> Vec<&Value> {
    spec.sinks
        .iter()
        .filter(|sink| sink["type"] == "topic" && sink["bridge"] == true)
        .collect()
}

#[tokio::test]
async fn test_new_parent_edge_creates_one_bridge() {
    let (admin, manager) = manager();
    let old = vec![pipeline("p", "P"), pipeline("c", "C")];
    let new = vec![pipeline("p", "P"), child_of(pipeline("c", "C"), "p")];

    let applied = manager.apply("orders", &old, &new).await.unwrap();

    assert_eq!(admin.topic_names(), vec!["orders_p_to_c"]);
    let sinks = bridge_sinks(find(&applied, "p"));
    assert_eq!(sinks.len(), 1);
    assert_eq!(sinks[0]["topic"], "orders_p_to_c");

    let source = &find(&applied, "c").source;
    assert_eq!(source["type"], "topic");
    assert_eq!(source["topic"], "orders_p_to_c");
    assert_eq!(source["consumer_group"], "orders_p_to_c_consumer");
}

#[tokio::test]
async fn test_reparenting_moves_the_bridge() {
    let (admin, manager) = manager();
    let first = vec![
        pipeline("p1", "P1"),
        pipeline("p2", "P2"),
        child_of(pipeline("c", "C"), "p1"),
    ];
    let bridged = manager.apply("wf", &[], &first).await.unwrap();

    let mut moved = bridged.clone();
    moved[2].parent_pipeline_id = Some("p2".into());
    let applied = manager.apply("wf", &bridged, &moved).await.unwrap();

    assert!(bridge_sinks(find(&applied, "p1")).is_empty());
    assert_eq!(bridge_sinks(find(&applied, "p2")).len(), 1);
    assert_eq!(find(&applied, "c").source["topic"], "wf_p2_to_c");
    assert!(wait_until(Duration::from_secs(1), || admin.topic_names() == vec!["wf_p2_to_c".to_string()]).await);
}

#[tokio::test]
async fn test_dropping_parent_resets_child_source() {
    let (admin, manager) = manager();
    let bridged = manager
        .apply("wf", &[], &[pipeline("p", "P"), child_of(pipeline("c", "C"), "p")])
        .await
        .unwrap();

    let mut detached = bridged.clone();
    detached[1].parent_pipeline_id = None;
    let applied = manager.apply("wf", &bridged, &detached).await.unwrap();

    assert!(find(&applied, "c").source.is_null());
    assert!(bridge_sinks(find(&applied, "p")).is_empty());
    assert!(wait_until(Duration::from_secs(1), || admin.topic_names().is_empty()).await);
}

#[tokio::test]
async fn test_restored_edge_keeps_its_topic() {
    let (admin, manager) = manager();
    let specs = vec![pipeline("p", "P"), child_of(pipeline("c", "C"), "p")];
    let bridged = manager.apply("wf", &[], &specs).await.unwrap();

    let mut detached = bridged.clone();
    detached[1].parent_pipeline_id = None;
    let detached = manager.apply("wf", &bridged, &detached).await.unwrap();

    let mut restored = detached.clone();
    restored[1].parent_pipeline_id = Some("p".into());
    let restored = manager.apply("wf", &detached, &restored).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(find(&restored, "c").source["topic"], "wf_p_to_c");
    assert_eq!(admin.topic_names(), vec!["wf_p_to_c"]);
}

#[tokio::test]
async fn test_failed_topic_delete_does_not_fail_apply() {
    let (admin, manager) = manager();
    let bridged = manager
        .apply("wf", &[], &[pipeline("p", "P"), child_of(pipeline("c", "C"), "p")])
        .await
        .unwrap();
    admin.fail_deletes(true);

    let mut detached = bridged.clone();
    detached[1].parent_pipeline_id = None;
    assert!(manager.apply("wf", &bridged, &detached).await.is_ok());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(admin.topic_names(), vec!["wf_p_to_c"]);
}

#[tokio::test]
async fn test_long_names_stay_within_limit() {
    let admin = Arc::new(MemoryTopicAdmin::new());
    let manager = TopicBridgeManager::new(
        admin.clone(),
        BridgeConfig {
            max_topic_name_len: 40,
            ..BridgeConfig::default()
        },
    );
    let parent = "extract-customer-records-from-warehouse";
    let specs = vec![
        pipeline(parent, "Extract"),
        child_of(pipeline("enrich a", "Enrich A"), parent),
        child_of(pipeline("enrich b", "Enrich B"), parent),
    ];

    manager.apply("customer sync", &[], &specs).await.unwrap();

    let names = admin.topic_names();
    assert_eq!(names.len(), 2);
    for name in &names {
        assert!(name.len() <= 40, "{name} is too long");
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)));
    }
}
