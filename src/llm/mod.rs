mod client;
mod reply;

pub(crate) use client::backoff_with_jitter;
pub use client::{HttpLlmClient, LlmClient};
pub use reply::{
    ask, schema_text, AuditResult, AuditStatus, ExecutorReply, FailureAttribution, PlannerReply,
    ProposedAction, ReflectorReply, Role, StagedCausalNode,
};
