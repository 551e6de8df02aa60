//! Snapshot persistence across engine runs

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{do_spec, plain_type, test_config, wait_for_status, want};
use mywant::dispatch::local::{AgentContext, DoAgentFn, StateUpdates};
use mywant::engine::ChainBuilder;
use mywant::want::WantStatus;

fn register_gen(handle: &mywant::engine::EngineHandle) {
    handle.want_types().store(plain_type("numbers-source"));
    handle.agents().register_do(
        do_spec("agent_gen", &["produce_numbers"]),
        Arc::new(DoAgentFn(|_ctx: AgentContext| async move {
            Ok(StateUpdates::from([(
                "produced".to_string(),
                json!([1, 2, 3]),
            )]))
        })),
    );
}

#[tokio::test]
async fn shutdown_snapshot_restores_isomorphic_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.yaml");
    let mut config = test_config();
    config.engine.snapshot_path = Some(path.clone());

    // First run: admit, achieve, quiesce.
    let first = ChainBuilder::init(config.clone()).unwrap();
    register_gen(&first);
    let gen = want(
        "gen",
        "numbers-source",
        &[("role", "source")],
        &["produce_numbers"],
        &[],
    );
    let id = first.add_wants(vec![gen]).await.unwrap()[0];
    wait_for_status(&first, id, WantStatus::Achieved).await;
    first.shutdown().await.unwrap();
    assert!(path.exists());

    // Second run: the graph comes back with IDs, labels, and state intact,
    // and every want lands in idle so readiness is re-derived.
    let second = ChainBuilder::init(config).unwrap();
    register_gen(&second);
    second.trigger_reconcile().await.unwrap();
    let restored = second.want(id).await.unwrap().unwrap();
    assert_eq!(restored.want.metadata.name, "gen");
    assert_eq!(restored.want.metadata.labels["role"], "source");
    assert_eq!(restored.state["produced"].value, json!([1, 2, 3]));

    // With its agent registered again, the restored want re-achieves.
    wait_for_status(&second, id, WantStatus::Achieved).await;
    second.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_snapshot_is_a_clean_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.engine.snapshot_path = Some(dir.path().join("never-written.yaml"));

    let handle = ChainBuilder::init(config).unwrap();
    let graph = handle.graph().await.unwrap();
    assert!(graph.wants.is_empty());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn yaml_admit_and_reemit_are_equivalent() {
    let handle = ChainBuilder::init(test_config()).unwrap();
    register_gen(&handle);

    let yaml = r#"
wants:
  - metadata:
      name: gen
      type: numbers-source
      labels:
        role: source
    spec:
      params:
        count: 3
      requires: [produce_numbers]
"#;
    let request: mywant::api::models::requests::AddWantsRequest =
        serde_yaml::from_str(yaml).unwrap();
    let originals = request.clone().into_wants();
    handle.add_wants(request.into_wants()).await.unwrap();

    // List, re-emit as YAML, parse again: the config survives the trip.
    let graph = handle.graph().await.unwrap();
    let emitted = serde_yaml::to_string(&graph).unwrap();
    let reparsed: mywant::snapshot::GraphSnapshot = serde_yaml::from_str(&emitted).unwrap();

    assert_eq!(reparsed.wants.len(), originals.len());
    for (reparsed, original) in reparsed.wants.iter().zip(&originals) {
        assert_eq!(reparsed.want.metadata.name, original.metadata.name);
        assert_eq!(reparsed.want.metadata.want_type, original.metadata.want_type);
        assert_eq!(reparsed.want.metadata.labels, original.metadata.labels);
        assert_eq!(reparsed.want.spec.params, original.spec.params);
        assert_eq!(reparsed.want.spec.requires, original.spec.requires);
    }

    handle.shutdown().await.unwrap();
}
