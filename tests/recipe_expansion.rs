//! Recipe expansion against a live engine

mod common;

use std::sync::Arc;

use serde_json::json;

use common::{do_spec, plain_type, test_config, wait_for_status, want};
use mywant::dispatch::local::{AgentContext, DoAgentFn, StateUpdates};
use mywant::engine::ChainBuilder;
use mywant::registry::agents::{Capability, StateField};
use mywant::want::WantStatus;

fn travel_recipe() -> mywant::recipes::Recipe {
    serde_yaml::from_str(
        r#"
metadata:
  name: travel-budget
  version: "1.0"
parameters:
  budget: 1000
wants:
  - name: budget
    type: budget-tracker
    labels:
      role: budget
    spec:
      params:
        limit: "{{ budget }}"
      requires: [budget_tracking]
  - name: hotel
    type: hotel-booker
    labels:
      role: hotel
    spec:
      requires: [hotel_booking]
"#,
    )
    .unwrap()
}

fn setup(handle: &mywant::engine::EngineHandle) {
    for ty in ["travel-planner", "budget-tracker", "hotel-booker"] {
        handle.want_types().store(plain_type(ty));
    }
    for capability in ["budget_tracking", "hotel_booking"] {
        handle.agents().register_capability(Capability {
            name: capability.into(),
            description: String::new(),
            parent_state_access: vec![StateField {
                name: "costs".into(),
                field_type: Some("number".into()),
            }],
        });
    }
    handle.agents().register_do(
        do_spec("agent_budget", &["budget_tracking"]),
        Arc::new(DoAgentFn(|_ctx: AgentContext| async move {
            Ok(StateUpdates::from([("tracked".to_string(), json!(true))]))
        })),
    );
    handle.agents().register_do(
        do_spec("agent_hotel", &["hotel_booking"]),
        Arc::new(DoAgentFn(|_ctx: AgentContext| async move {
            Ok(StateUpdates::from([("booked".to_string(), json!(true))]))
        })),
    );
    handle.recipes().register(travel_recipe());
}

#[tokio::test]
async fn expansion_creates_correlated_children() {
    let handle = ChainBuilder::init(test_config()).unwrap();
    setup(&handle);

    let mut planner = want("planner", "travel-planner", &[], &[], &[]);
    planner.spec.recipe = Some("travel-budget".into());
    let planner_id = handle.add_wants(vec![planner]).await.unwrap()[0];
    wait_for_status(&handle, planner_id, WantStatus::Achieved).await;

    let budget = loop {
        if let Some(snapshot) = handle.want_by_name("budget").await.unwrap() {
            break snapshot;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };
    let hotel = handle.want_by_name("hotel").await.unwrap().unwrap();

    // Both children are controller-owned by the planner.
    for child in [&budget, &hotel] {
        assert!(child.want.is_controlled_by(planner_id));
    }
    // The recipe default substituted into the child's params.
    assert_eq!(budget.want.spec.params["limit"], json!(1000));

    // Sibling correlation carries the parent-state access label.
    let expected = format!("stateAccess/{}.costs", planner_id);
    let budget_id = budget.want.metadata.id.unwrap();
    let hotel_id = hotel.want.metadata.id.unwrap();
    assert_eq!(budget.want.metadata.correlations.len(), 1);
    assert_eq!(budget.want.metadata.correlations[0].want_id, hotel_id);
    assert!(budget.want.metadata.correlations[0].labels.contains(&expected));
    assert_eq!(hotel.want.metadata.correlations[0].want_id, budget_id);
    assert!(hotel.want.metadata.correlations[0].labels.contains(&expected));

    // The children run their own Do-cycles.
    wait_for_status(&handle, budget_id, WantStatus::Achieved).await;
    wait_for_status(&handle, hotel_id, WantStatus::Achieved).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn deleting_the_parent_removes_expanded_children() {
    let handle = ChainBuilder::init(test_config()).unwrap();
    setup(&handle);

    let mut planner = want("planner", "travel-planner", &[], &[], &[]);
    planner.spec.recipe = Some("travel-budget".into());
    let planner_id = handle.add_wants(vec![planner]).await.unwrap()[0];
    wait_for_status(&handle, planner_id, WantStatus::Achieved).await;

    let budget_id = loop {
        if let Some(snapshot) = handle.want_by_name("budget").await.unwrap() {
            break snapshot.want.metadata.id.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };
    let hotel_id = handle
        .want_by_name("hotel")
        .await
        .unwrap()
        .unwrap()
        .want
        .metadata
        .id
        .unwrap();

    let deleted = handle.delete_wants(vec![planner_id]).await.unwrap();
    assert_eq!(deleted.len(), 3);
    // Children first, the owner last.
    assert_eq!(deleted[2], planner_id);
    assert!(deleted[..2].contains(&budget_id));
    assert!(deleted[..2].contains(&hotel_id));

    let graph = handle.graph().await.unwrap();
    assert!(graph.wants.is_empty());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn expansion_happens_once() {
    let handle = ChainBuilder::init(test_config()).unwrap();
    setup(&handle);

    let mut planner = want("planner", "travel-planner", &[], &[], &[]);
    planner.spec.recipe = Some("travel-budget".into());
    let planner_id = handle.add_wants(vec![planner]).await.unwrap()[0];
    wait_for_status(&handle, planner_id, WantStatus::Achieved).await;

    // Repeated passes must not re-expand an already expanded recipe.
    handle.trigger_reconcile().await.unwrap();
    handle.trigger_reconcile().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let graph = handle.graph().await.unwrap();
    assert_eq!(graph.wants.len(), 3);
    let planner = handle.want(planner_id).await.unwrap().unwrap();
    assert!(planner.want.recipe_expanded);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_recipe_records_an_error() {
    let handle = ChainBuilder::init(test_config()).unwrap();
    handle.want_types().store(plain_type("travel-planner"));

    let mut planner = want("planner", "travel-planner", &[], &[], &[]);
    planner.spec.recipe = Some("no-such-recipe".into());
    let planner_id = handle.add_wants(vec![planner]).await.unwrap()[0];

    common::wait_for_state(&handle, planner_id, |state| {
        state
            .get("recipe_error")
            .and_then(|v| v.as_str())
            .map(|s| s.contains("no-such-recipe"))
            .unwrap_or(false)
    })
    .await;
    assert!(!handle.errors().is_empty());

    handle.shutdown().await.unwrap();
}
