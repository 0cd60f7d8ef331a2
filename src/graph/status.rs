use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle of a node in the task DAG.
///
/// Terminal states are sticky: no command sequence may move a node out of
/// them. `Stalled` is deliberately non-terminal so the planner can revive
/// or prune a stuck subtask.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    Deprecated,
    Aborted,
    Stalled,
}

impl NodeStatus {
    pub fn allowed_transitions(&self) -> &'static [NodeStatus] {
        use NodeStatus::*;
        match self {
            Pending => &[InProgress, Deprecated],
            InProgress => &[Completed, Failed, Aborted, Stalled, Deprecated],
            Stalled => &[InProgress, Failed, Deprecated],
            Completed => &[],
            Failed => &[],
            Aborted => &[],
            Deprecated => &[],
        }
    }

    pub fn can_transition_to(&self, target: NodeStatus) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Aborted | NodeStatus::Deprecated
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeStatus::Completed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Deprecated => "deprecated",
            Self::Aborted => "aborted",
            Self::Stalled => "stalled",
        };
        write!(f, "{}", s)
    }
}

/// Failure attribution assigned by the reflector when an audit fails.
///
/// The scheduler routes on these: L0/L1 retry in place, L2 re-plans the
/// parent, L3/L4 re-plan the operation, L5 aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum FailureLevel {
    /// Transient external/environmental failure.
    L0,
    /// Tool transport failure.
    L1,
    /// Tool misuse: wrong arguments or schema.
    L2,
    /// Reasoning error: the hypothesis had no supporting evidence.
    L3,
    /// Goal infeasible given current evidence.
    L4,
    /// Unrecoverable.
    L5,
}

impl FailureLevel {
    pub fn auto_retry(&self) -> bool {
        matches!(self, FailureLevel::L0 | FailureLevel::L1)
    }

    pub fn replans_parent(&self) -> bool {
        matches!(self, FailureLevel::L2)
    }

    pub fn replans_operation(&self) -> bool {
        matches!(self, FailureLevel::L3 | FailureLevel::L4)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureLevel::L5)
    }
}

impl fmt::Display for FailureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
            Self::L4 => "L4",
            Self::L5 => "L5",
        };
        write!(f, "{}", s)
    }
}
