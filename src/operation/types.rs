use serde::{Deserialize, Serialize};

use crate::graph::FailureLevel;

/// Console/stream verbosity for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Simple,
    #[default]
    Default,
    Debug,
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Simple => "simple",
            Self::Default => "default",
            Self::Debug => "debug",
        };
        write!(f, "{}", s)
    }
}

/// Per-run options; anything unset falls back to configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationOpts {
    pub max_parallel: Option<usize>,
    pub step_budget: Option<usize>,
    pub hitl: Option<bool>,
    pub planner_model: Option<String>,
    pub executor_model: Option<String>,
    pub reflector_model: Option<String>,
    pub output_mode: OutputMode,
}

/// Terminal and live states of one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed {
        level: FailureLevel,
        rationale: String,
    },
    Aborted,
    /// The runtime cannot make progress and awaits human input.
    Stalled {
        reason: String,
    },
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed { level, rationale } => write!(f, "failed({}, {})", level, rationale),
            Self::Aborted => write!(f, "aborted"),
            Self::Stalled { reason } => write!(f, "stalled({})", reason),
        }
    }
}
