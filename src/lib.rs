pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod guidance;
pub mod intervention;
pub mod llm;
pub mod operation;
pub mod persist;
pub mod planner;
pub mod reflector;
pub mod scheduler;
pub mod tools;
pub mod utils;

pub use broker::{Event, EventBroker, EventKind, Phase};
pub use config::{RedpilotConfig, StateDir};
pub use error::{RedpilotError, Result};
pub use executor::{ExecVerdict, Executor, SubtaskOutcome};
pub use graph::{
    CausalKind, CausalRelation, FailureLevel, GraphCommand, GraphStore, NodeStatus,
};
pub use guidance::{GuidanceSource, NullGuidance};
pub use intervention::{Decision, InterventionAction, InterventionGate};
pub use llm::{HttpLlmClient, LlmClient, Role};
pub use operation::{
    GraphSelector, OpContext, OperationManager, OperationOpts, OperationStatus, OutputMode,
};
pub use persist::{CheckpointStore, EventLog, OperationCheckpoint};
pub use planner::Planner;
pub use reflector::Reflector;
pub use scheduler::{AbortSignal, Scheduler};
pub use tools::{HttpToolHost, ToolHost, ToolOutcome, ToolSpec};
