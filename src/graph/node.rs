use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RejectReason;

use super::status::{FailureLevel, NodeStatus};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Root,
    #[default]
    Task,
    Action,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => write!(f, "root"),
            Self::Task => write!(f, "task"),
            Self::Action => write!(f, "action"),
        }
    }
}

/// A node in the task DAG: the root goal, a planned subtask, or one
/// executed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub kind: NodeKind,
    pub description: String,

    #[serde(default)]
    pub completion_criteria: String,

    pub status: NodeStatus,

    /// Task ids that must reach a terminal success state first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Containing task for actions, root for top-level tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Opaque payloads attached by the executor.
    #[serde(default)]
    pub artifacts: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_level: Option<FailureLevel>,

    #[serde(default)]
    pub retry_count: u32,

    /// Set on the root when the reflector confirms the goal.
    #[serde(default)]
    pub mission_accomplished: bool,

    // Action-only fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<String>,
}

impl TaskNode {
    pub fn new(id: impl Into<String>, kind: NodeKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            description: description.into(),
            completion_criteria: String::new(),
            status: NodeStatus::Pending,
            dependencies: Vec::new(),
            parent: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            artifacts: Vec::new(),
            failure_level: None,
            retry_count: 0,
            mission_accomplished: false,
            tool_name: None,
            tool_args: None,
            result: None,
            observation: None,
        }
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.completion_criteria = criteria.into();
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>, args: Value) -> Self {
        self.tool_name = Some(name.into());
        self.tool_args = Some(args);
        self
    }

    pub fn is_task(&self) -> bool {
        self.kind == NodeKind::Task
    }

    pub fn is_action(&self) -> bool {
        self.kind == NodeKind::Action
    }

    /// Apply a transition, stamping the lifecycle timestamps.
    ///
    /// Callers must have checked `can_transition_to` first; this is the
    /// single place timestamps get written.
    pub(super) fn transition(&mut self, target: NodeStatus) {
        if target == NodeStatus::InProgress && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if target.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = target;
    }

    /// Partial merge of a wire `updates` object.
    ///
    /// Returns the status transition if one occurred. Unknown keys and
    /// illegal transitions are rejected: the boundary is strict so the
    /// planner's mistakes surface as rejections rather than silent drops.
    pub(super) fn apply_updates(
        &mut self,
        updates: &serde_json::Map<String, Value>,
    ) -> Result<Option<(NodeStatus, NodeStatus)>, (RejectReason, String)> {
        let mut change = None;

        if let Some(value) = updates.get("status") {
            let target: NodeStatus = serde_json::from_value(value.clone()).map_err(|e| {
                (
                    RejectReason::InvariantViolation,
                    format!("invalid status for {}: {}", self.id, e),
                )
            })?;
            if target != self.status {
                if self.status.is_terminal() {
                    return Err((
                        RejectReason::TerminalViolation,
                        format!("{} is terminal ({})", self.id, self.status),
                    ));
                }
                if !self.status.can_transition_to(target) {
                    return Err((
                        RejectReason::InvariantViolation,
                        format!("illegal transition {} -> {} on {}", self.status, target, self.id),
                    ));
                }
                let from = self.status;
                self.transition(target);
                change = Some((from, target));
            }
        }

        for (key, value) in updates {
            match key.as_str() {
                "status" => {}
                "description" => {
                    self.description = parse_field(&self.id, key, value)?;
                }
                "completion_criteria" => {
                    self.completion_criteria = parse_field(&self.id, key, value)?;
                }
                "dependencies" => {
                    self.dependencies = parse_field(&self.id, key, value)?;
                }
                "artifacts" => {
                    self.artifacts = parse_field(&self.id, key, value)?;
                }
                "failure_level" => {
                    self.failure_level = Some(parse_field(&self.id, key, value)?);
                }
                "retry_count" => {
                    self.retry_count = parse_field(&self.id, key, value)?;
                }
                "mission_accomplished" => {
                    self.mission_accomplished = parse_field(&self.id, key, value)?;
                }
                "result" => {
                    self.result = Some(parse_field(&self.id, key, value)?);
                }
                "observation" => {
                    self.observation = Some(parse_field(&self.id, key, value)?);
                }
                other => {
                    return Err((
                        RejectReason::InvariantViolation,
                        format!("unknown update field `{}` on {}", other, self.id),
                    ));
                }
            }
        }

        Ok(change)
    }
}

fn parse_field<T: serde::de::DeserializeOwned>(
    id: &str,
    key: &str,
    value: &Value,
) -> Result<T, (RejectReason, String)> {
    serde_json::from_value(value.clone()).map_err(|e| {
        (
            RejectReason::InvariantViolation,
            format!("invalid `{}` for {}: {}", key, id, e),
        )
    })
}

/// Wire shape of `ADD_NODE`'s `node_data`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NodeDraft {
    pub id: String,
    #[serde(default)]
    pub kind: NodeKind,
    pub description: String,
    #[serde(default)]
    pub completion_criteria: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,
}

impl NodeDraft {
    pub fn task(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Task,
            description: description.into(),
            completion_criteria: String::new(),
            dependencies: Vec::new(),
            parent: None,
            tool_name: None,
            tool_args: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_criteria(mut self, criteria: impl Into<String>) -> Self {
        self.completion_criteria = criteria.into();
        self
    }

    pub fn into_node(self) -> TaskNode {
        let mut node = TaskNode::new(self.id, self.kind, self.description)
            .with_criteria(self.completion_criteria)
            .with_dependencies(self.dependencies);
        node.parent = self.parent;
        node.tool_name = self.tool_name;
        node.tool_args = self.tool_args;
        node
    }
}
