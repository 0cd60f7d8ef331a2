mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{
    executor_action, executor_complete, manager_with, planner_adds, reflector_failed,
    reflector_reply, FakeTools, ScriptedLlm,
};
use redpilot::graph::{CausalKind, NodeStatus};
use redpilot::llm::Role;
use redpilot::operation::{GraphSelector, OperationOpts, OperationStatus};
use redpilot::tools::ToolOutcome;

fn opts() -> OperationOpts {
    OperationOpts::default()
}

#[tokio::test]
async fn happy_path_single_task() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(
        Role::Executor,
        executor_action("http_get", json!({"url": "/login"})),
    );
    llm.push(
        Role::Executor,
        executor_complete(
            "login form enumerated",
            vec![json!({
                "variant": "key_fact",
                "fields": { "description": "login form present" }
            })],
        ),
    );
    llm.push(
        Role::Reflector,
        reflector_reply(
            "passed",
            true,
            vec![json!({
                "command": "ADD_CAUSAL_NODE",
                "variant": "key_fact",
                "fields": { "description": "login form present" }
            })],
        ),
    );

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools.clone(), |_| {}).await;

    let op_id = manager
        .start_operation("probe /login for weak credentials", opts())
        .await
        .unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert_eq!(tasks["tasks"]["root"]["status"], "completed");
    assert_eq!(tasks["tasks"]["root"]["mission_accomplished"], true);
    assert_eq!(tasks["tasks"]["t1"]["status"], "completed");

    let causal = manager
        .snapshot(&op_id, GraphSelector::Causal)
        .await
        .unwrap();
    let nodes = causal["nodes"].as_object().unwrap();
    assert_eq!(nodes.len(), 1);
    let node = nodes.values().next().unwrap();
    assert_eq!(node["kind"], "key_fact");
    assert_eq!(node["description"], "login form present");

    assert_eq!(tools.call_count(), 1);
}

#[tokio::test]
async fn parallel_dispatch_respects_fanout_bound() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(
        Role::Planner,
        planner_adds(&[("t1", &[]), ("t2", &[]), ("t3", &[])]),
    );
    // One probing action per task; completion comes from the fallback.
    for _ in 0..3 {
        llm.push(
            Role::Executor,
            executor_action("http_get", json!({"url": "/"})),
        );
    }
    llm.push(Role::Reflector, reflector_reply("passed", false, vec![]));
    llm.push(Role::Reflector, reflector_reply("passed", false, vec![]));
    llm.push(Role::Reflector, reflector_reply("passed", true, vec![]));

    let tools = Arc::new(FakeTools::with_outcome(
        Duration::from_millis(120),
        |_, _| ToolOutcome::Success {
            output: "ok".into(),
            truncated: false,
        },
    ));
    let (manager, _dir) = manager_with(llm, tools.clone(), |_| {}).await;

    let op_id = manager
        .start_operation(
            "sweep three endpoints",
            OperationOpts {
                max_parallel: Some(2),
                ..opts()
            },
        )
        .await
        .unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    assert!(
        tools.peak_concurrency() <= 2,
        "at most two tasks may run at once, saw {}",
        tools.peak_concurrency()
    );
}

#[tokio::test]
async fn dependencies_gate_dispatch_order() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[]), ("t2", &["t1"])]));
    llm.push(Role::Reflector, reflector_reply("passed", false, vec![]));
    llm.push(Role::Reflector, reflector_reply("passed", true, vec![]));

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager
        .start_operation("ordered sweep", opts())
        .await
        .unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    // Dispatch order is visible through status-change events: t1 must
    // enter in_progress before t2 does.
    let events = common::settled_tail(&manager, &op_id).await;
    let mut started = Vec::new();
    for event in &events {
        if event.event == redpilot::EventKind::GraphChanged {
            if let Some(changes) = event.data["status_changes"].as_array() {
                for change in changes {
                    if change["to"] == "in_progress" && change["id"] != "root" {
                        started.push(change["id"].as_str().unwrap().to_string());
                    }
                }
            }
        }
    }
    assert_eq!(started, vec!["t1", "t2"]);
}

#[tokio::test]
async fn cycle_batch_is_rejected_then_replanned() {
    let llm = Arc::new(ScriptedLlm::new());
    // First plan closes a cycle and must bounce off the store.
    llm.push(
        Role::Planner,
        json!({
            "thought": "broken plan",
            "graph_operations": [
                {"command": "ADD_NODE", "node_data": {"id": "t1", "kind": "task", "description": "a"}},
                {"command": "ADD_NODE", "node_data": {"id": "t2", "kind": "task", "description": "b", "dependencies": ["t1"]}},
                {"command": "ADD_EDGE", "source": "t1", "target": "t2", "relation": "depends_on"}
            ],
            "goal_achieved": false
        }),
    );
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(Role::Reflector, reflector_reply("passed", true, vec![]));

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    let events = common::settled_tail(&manager, &op_id).await;
    let rejected: Vec<_> = events
        .iter()
        .filter(|e| e.event == redpilot::EventKind::GraphRejected)
        .collect();
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].data["rejections"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["reason"] == "cycle"));

    // Nothing from the rejected batch leaked into the graph.
    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert!(tasks["tasks"]["t2"].is_null());
    assert!(tasks["tasks"]["t1"]["dependencies"]
        .as_array()
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn abort_mid_execution_finalizes_within_grace() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(
        Role::Planner,
        planner_adds(&[("t1", &[]), ("t2", &[]), ("t3", &[])]),
    );
    for _ in 0..3 {
        llm.push(
            Role::Executor,
            executor_action("http_get", json!({"url": "/slow"})),
        );
    }

    // Tool calls hang far beyond the test horizon; only cancellation can
    // finish them.
    let tools = Arc::new(FakeTools::with_outcome(
        Duration::from_secs(300),
        |_, _| ToolOutcome::Success {
            output: "never".into(),
            truncated: false,
        },
    ));
    let (manager, _dir) = manager_with(llm.clone(), tools.clone(), |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();

    // Let every worker get into its tool call before pulling the plug.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while tools.call_count() < 3 {
        assert!(std::time::Instant::now() < deadline, "workers never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let calls_before = llm.call_count();
    manager.abort_operation(&op_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), manager.wait(&op_id))
        .await
        .expect("abort must finalize within the grace period")
        .unwrap();
    assert_eq!(status, OperationStatus::Aborted);

    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    for (id, task) in tasks["tasks"].as_object().unwrap() {
        if id != "root" {
            assert_eq!(task["status"], "aborted", "task {} not aborted", id);
        }
    }
    assert_eq!(tasks["tasks"]["root"]["status"], "aborted");

    // No further model calls after the abort landed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(llm.call_count(), calls_before);

    // Aborting again is a no-op.
    manager.abort_operation(&op_id).await.unwrap();
}

#[tokio::test]
async fn empty_plan_with_unmet_goal_stalls() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(Role::Reflector, reflector_reply("passed", false, vec![]));
    // Second planning round: the fallback returns an empty batch with
    // goal_achieved=false.

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert!(
        matches!(status, OperationStatus::Stalled { .. }),
        "expected stalled, got {}",
        status
    );

    let events = common::settled_tail(&manager, &op_id).await;
    assert!(events
        .iter()
        .any(|e| e.event == redpilot::EventKind::InterventionRequired
            && e.data["kind"] == "stall"));
    // A stall never dispatches: the only executing phase was the first
    // round's.
    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert_eq!(tasks["tasks"]["root"]["status"], "stalled");
}

#[tokio::test]
async fn l2_failure_triggers_replan() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    // The executor keeps issuing the identical failing call until the
    // repeat detector trips at three.
    for _ in 0..3 {
        llm.push(
            Role::Executor,
            executor_action("http_get", json!({"url": "/x"})),
        );
    }
    llm.push(Role::Reflector, reflector_failed("L2", "tool misuse"));
    llm.push(Role::Planner, planner_adds(&[("t2", &[])]));
    llm.push(Role::Reflector, reflector_reply("passed", true, vec![]));

    let tools = Arc::new(FakeTools::with_outcome(
        Duration::from_millis(5),
        |_, _| ToolOutcome::Failure {
            message: "404".into(),
        },
    ));
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert_eq!(tasks["tasks"]["t1"]["status"], "failed");
    assert_eq!(tasks["tasks"]["t1"]["failure_level"], "L2");
    assert_eq!(tasks["tasks"]["t2"]["status"], "completed");
}

#[tokio::test]
async fn transient_failure_retries_then_fails() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(Role::Executor, executor_complete("first try", vec![]));
    llm.push(Role::Executor, executor_complete("second try", vec![]));
    llm.push(Role::Reflector, reflector_failed("L0", "target flapping"));
    llm.push(Role::Reflector, reflector_failed("L0", "target flapping"));
    llm.push(Role::Planner, json!({
        "thought": "nothing else to try",
        "graph_operations": [],
        "goal_achieved": false
    }));

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |config| {
        config.operation.max_task_retries = 1;
    })
    .await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert!(matches!(status, OperationStatus::Stalled { .. }));

    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert_eq!(tasks["tasks"]["t1"]["status"], "failed");
    assert_eq!(tasks["tasks"]["t1"]["failure_level"], "L0");
    assert_eq!(tasks["tasks"]["t1"]["retry_count"], 1);
}

#[tokio::test]
async fn fatal_attribution_fails_the_operation() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(Role::Executor, executor_complete("claims done", vec![]));
    llm.push(Role::Reflector, reflector_failed("L5", "credentials revoked"));

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    match status {
        OperationStatus::Failed { level, rationale } => {
            assert_eq!(level, redpilot::FailureLevel::L5);
            assert!(rationale.contains("credentials revoked"));
        }
        other => panic!("expected failed(L5), got {}", other),
    }

    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert_eq!(tasks["tasks"]["root"]["status"], "failed");
    assert_eq!(tasks["tasks"]["root"]["failure_level"], "L5");
}

#[tokio::test]
async fn oversized_tool_output_is_survivable() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(
        Role::Executor,
        executor_action("http_get", json!({"url": "/dump"})),
    );
    llm.push(Role::Reflector, reflector_reply("passed", true, vec![]));

    // The host port contract caps output; simulate a host that already
    // clipped a huge body and flagged it.
    let tools = Arc::new(FakeTools::with_outcome(
        Duration::from_millis(5),
        |_, _| ToolOutcome::Success {
            output: format!("{}...[truncated]", "A".repeat(10_000)),
            truncated: true,
        },
    ));
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    let action = tasks["tasks"]
        .as_object()
        .unwrap()
        .values()
        .find(|t| t["kind"] == "action")
        .expect("one action node");
    assert_eq!(action["status"], "completed");
    assert!(action["observation"]
        .as_str()
        .unwrap()
        .contains("[truncated]"));
}

#[tokio::test]
async fn step_budget_exhaustion_fails_with_l4() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    for _ in 0..10 {
        llm.push(
            Role::Executor,
            executor_action("http_get", json!({"url": "/a"})),
        );
        llm.push(
            Role::Executor,
            executor_action("http_get", json!({"url": "/b"})),
        );
    }
    llm.push(Role::Reflector, reflector_failed("L4", "budget spent"));

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |config| {
        config.executor.max_steps = 4;
        config.operation.step_budget = 4;
    })
    .await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert!(matches!(
        status,
        OperationStatus::Failed {
            level: redpilot::FailureLevel::L4,
            ..
        }
    ));
}

#[tokio::test]
async fn mission_veto_ignores_ready_tasks() {
    let llm = Arc::new(ScriptedLlm::new());
    llm.push(
        Role::Planner,
        planner_adds(&[("t1", &[]), ("t2", &["t1"]), ("t3", &["t1"])]),
    );
    llm.push(
        Role::Executor,
        executor_complete(
            "flag captured",
            vec![json!({
                "variant": "evidence",
                "fields": { "description": "flag string observed", "source_action_id": "a1" }
            })],
        ),
    );
    llm.push(
        Role::Reflector,
        reflector_reply(
            "passed",
            true,
            vec![json!({
                "command": "ADD_CAUSAL_NODE",
                "variant": "confirmed_vulnerability",
                "fields": { "description": "auth bypass proven", "source_action_id": "a1" }
            })],
        ),
    );

    let tools = Arc::new(FakeTools::ok());
    let (manager, _dir) = manager_with(llm, tools, |_| {}).await;

    let op_id = manager.start_operation("goal", opts()).await.unwrap();
    let status = manager.wait(&op_id).await.unwrap();
    assert_eq!(status, OperationStatus::Succeeded);

    // t2/t3 became ready the moment t1 completed, but the hard veto wins;
    // they are finalized without execution.
    let tasks = manager.snapshot(&op_id, GraphSelector::Task).await.unwrap();
    assert_eq!(tasks["tasks"]["root"]["status"], "completed");
    assert_ne!(tasks["tasks"]["t2"]["status"], "completed");
    assert_ne!(tasks["tasks"]["t3"]["status"], "completed");

    let causal = manager
        .snapshot(&op_id, GraphSelector::Causal)
        .await
        .unwrap();
    assert!(causal["nodes"]
        .as_object()
        .unwrap()
        .values()
        .any(|n| n["kind"] == json!(CausalKind::ConfirmedVulnerability)));
}

#[tokio::test]
async fn over_capacity_is_reported() {
    let llm = Arc::new(ScriptedLlm::new());
    // Hold operations open: planner never replies with anything useful,
    // but each op keeps its slot until it stalls; use hanging tools to
    // keep the first op running.
    llm.push(Role::Planner, planner_adds(&[("t1", &[])]));
    llm.push(
        Role::Executor,
        executor_action("http_get", json!({"url": "/slow"})),
    );

    let tools = Arc::new(FakeTools::with_outcome(
        Duration::from_secs(300),
        |_, _| ToolOutcome::Success {
            output: "never".into(),
            truncated: false,
        },
    ));
    let (manager, _dir) = manager_with(llm, tools, |config| {
        config.operation.capacity = 1;
    })
    .await;

    let first = manager.start_operation("goal one", opts()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = manager.start_operation("goal two", opts()).await.unwrap_err();
    assert!(matches!(err, redpilot::RedpilotError::OverCapacity { .. }));

    manager.abort_operation(&first).await.unwrap();
    let _ = manager.wait(&first).await;
}

// Verify NodeStatus wire names used throughout the assertions above.
#[test]
fn node_status_wire_names() {
    assert_eq!(serde_json::to_value(NodeStatus::InProgress).unwrap(), "in_progress");
    assert_eq!(serde_json::to_value(NodeStatus::Stalled).unwrap(), "stalled");
}
