use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::Role;

/// Every event kind an operation's topic can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    GraphChanged,
    GraphRejected,
    ExecutionStepCompleted,
    LlmRequest,
    LlmResponse,
    InterventionRequired,
    InterventionResolved,
    PhaseChanged,
    MissionAccomplished,
    OperationAborted,
    Heartbeat,
    /// Marker inserted where a subscriber's queue was truncated.
    Overflow,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphChanged => "graph.changed",
            Self::GraphRejected => "graph.rejected",
            Self::ExecutionStepCompleted => "execution.step.completed",
            Self::LlmRequest => "llm.request",
            Self::LlmResponse => "llm.response",
            Self::InterventionRequired => "intervention.required",
            Self::InterventionResolved => "intervention.resolved",
            Self::PhaseChanged => "phase.changed",
            Self::MissionAccomplished => "mission.accomplished",
            Self::OperationAborted => "operation.aborted",
            Self::Heartbeat => "heartbeat",
            Self::Overflow => "overflow",
        }
    }

    pub fn is_llm(&self) -> bool {
        matches!(self, Self::LlmRequest | Self::LlmResponse)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::MissionAccomplished | Self::OperationAborted)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduler phase announced on `phase.changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Executing,
    Reflecting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Reflecting => "reflecting",
        };
        write!(f, "{}", s)
    }
}

/// The wire envelope: `seq` is monotonic per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default)]
    pub data: Value,
}
