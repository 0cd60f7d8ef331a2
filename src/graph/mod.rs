mod causal;
mod command;
mod cycle;
mod node;
mod status;
mod store;
pub mod summary;

pub use causal::{CausalDraft, CausalEdge, CausalKind, CausalNode, CausalRelation};
pub use command::{validate_batch, GraphCommand};
pub use cycle::detect_cycle;
pub use node::{NodeDraft, NodeKind, TaskNode};
pub use status::{FailureLevel, NodeStatus};
pub use store::{ApplyOutcome, GraphState, GraphStore, GraphView, StatusChange};
