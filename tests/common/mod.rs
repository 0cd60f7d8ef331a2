//! Scripted ports shared by the integration suites.
//!
//! The fakes are deliberately dumb: per-role reply queues with a safe
//! fallback, and a tool host that can gauge concurrency or hang until
//! cancelled.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use redpilot::config::RedpilotConfig;
use redpilot::error::Result;
use redpilot::guidance::NullGuidance;
use redpilot::llm::{LlmClient, Role};
use redpilot::operation::OperationManager;
use redpilot::tools::{ToolHost, ToolOutcome, ToolSpec};
use redpilot::StateDir;

/// Per-role reply queues. When a queue runs dry the role's fallback is
/// served, so a finished script winds the operation down instead of
/// hanging the test.
#[derive(Default)]
pub struct ScriptedLlm {
    queues: Mutex<HashMap<Role, VecDeque<String>>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, role: Role, reply: Value) {
        self.queues
            .lock()
            .entry(role)
            .or_default()
            .push_back(reply.to_string());
    }

    /// Queue a reply verbatim, JSON or not.
    pub fn push_raw(&self, role: Role, reply: &str) {
        self.queues
            .lock()
            .entry(role)
            .or_default()
            .push_back(reply.to_string());
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn fallback(role: Role) -> String {
        match role {
            Role::Planner => json!({
                "thought": "nothing further to plan",
                "graph_operations": [],
                "goal_achieved": false
            }),
            Role::Executor => json!({
                "thought": "wrapping up",
                "execution_operations": [],
                "is_subtask_complete": true,
                "summary": "done"
            }),
            Role::Reflector => json!({
                "audit_result": {
                    "status": "passed",
                    "completion_check": "criteria satisfied",
                    "logic_issues": []
                },
                "causal_graph_updates": [],
                "global_mission_accomplished": false
            }),
        }
        .to_string()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, role: Role, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .queues
            .lock()
            .get_mut(&role)
            .and_then(|q| q.pop_front());
        Ok(reply.unwrap_or_else(|| Self::fallback(role)))
    }
}

/// Tool host fake with a concurrency gauge and optional per-call delay.
pub struct FakeTools {
    delay: Duration,
    outcome: Box<dyn Fn(&str, &Value) -> ToolOutcome + Send + Sync>,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeTools {
    pub fn ok() -> Self {
        Self::with_outcome(Duration::from_millis(10), |_, _| ToolOutcome::Success {
            output: "HTTP 200 OK".to_string(),
            truncated: false,
        })
    }

    pub fn with_outcome(
        delay: Duration,
        outcome: impl Fn(&str, &Value) -> ToolOutcome + Send + Sync + 'static,
    ) -> Self {
        Self {
            delay,
            outcome: Box::new(outcome),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Highest number of concurrent calls observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolHost for FakeTools {
    async fn list_tools(&self) -> Result<Vec<ToolSpec>> {
        Ok(vec![ToolSpec {
            name: "http_get".to_string(),
            description: "fetch a url".to_string(),
            schema: Value::Null,
        }])
    }

    async fn call_tool(&self, name: &str, args: &Value, _deadline: Duration) -> Result<ToolOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;

        let outcome = (self.outcome)(name, args);
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// The persisted event tail, after giving the persistence pump a moment
/// to drain.
pub async fn settled_tail(
    manager: &OperationManager,
    op_id: &str,
) -> Vec<redpilot::broker::Event> {
    tokio::time::sleep(Duration::from_millis(300)).await;
    manager.event_tail(op_id, 0).await.unwrap()
}

/// A manager wired to scripted ports in a temp state dir.
pub async fn manager_with(
    llm: Arc<ScriptedLlm>,
    tools: Arc<FakeTools>,
    configure: impl FnOnce(&mut RedpilotConfig),
) -> (OperationManager, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let state = StateDir::new(dir.path());
    let mut config = RedpilotConfig::default();
    configure(&mut config);
    let manager = OperationManager::new(config, &state, llm, tools, Arc::new(NullGuidance))
        .await
        .unwrap();
    (manager, dir)
}

// Reply builders.

pub fn planner_adds(tasks: &[(&str, &[&str])]) -> Value {
    let ops: Vec<Value> = tasks
        .iter()
        .map(|(id, deps)| {
            json!({
                "command": "ADD_NODE",
                "node_data": {
                    "id": id,
                    "kind": "task",
                    "description": format!("task {}", id),
                    "completion_criteria": "done",
                    "dependencies": deps.iter().map(|d| d.to_string()).collect::<Vec<_>>()
                }
            })
        })
        .collect();
    json!({
        "thought": "plan",
        "graph_operations": ops,
        "goal_achieved": false
    })
}

pub fn executor_action(tool: &str, params: Value) -> Value {
    json!({
        "thought": "try a probe",
        "execution_operations": [{ "tool": tool, "params": params }],
        "is_subtask_complete": false
    })
}

pub fn executor_complete(summary: &str, staged: Vec<Value>) -> Value {
    json!({
        "thought": "objective met",
        "execution_operations": [],
        "is_subtask_complete": true,
        "summary": summary,
        "staged_causal_nodes": staged
    })
}

pub fn reflector_reply(status: &str, mission: bool, updates: Vec<Value>) -> Value {
    json!({
        "audit_result": {
            "status": status,
            "completion_check": "checked",
            "logic_issues": []
        },
        "causal_graph_updates": updates,
        "global_mission_accomplished": mission
    })
}

pub fn reflector_failed(level: &str, rationale: &str) -> Value {
    json!({
        "audit_result": {
            "status": "failed",
            "completion_check": "criteria unmet",
            "logic_issues": []
        },
        "causal_graph_updates": [],
        "failure_attribution": { "level": level, "rationale": rationale },
        "global_mission_accomplished": false
    })
}
