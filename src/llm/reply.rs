use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::error::{RedpilotError, Result};
use crate::graph::{CausalDraft, CausalKind, GraphCommand};
use crate::operation::OpContext;

use super::client::LlmClient;

/// The three reasoning roles. Each resolves to its own model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Planner,
    Executor,
    Reflector,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Reflector => "reflector",
        };
        write!(f, "{}", s)
    }
}

/// Planner output: a batch of graph mutations plus the goal verdict.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannerReply {
    pub thought: String,
    #[serde(default)]
    pub graph_operations: Vec<GraphCommand>,
    #[serde(default)]
    pub goal_achieved: bool,
}

/// One tool invocation proposed by the executor.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ProposedAction {
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Optional caller-chosen id for the resulting action node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

/// A causal node proposed by the executor, pending the reflector's audit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StagedCausalNode {
    pub variant: CausalKind,
    pub fields: CausalDraft,
}

/// Executor output: either further actions or a completion claim with the
/// beliefs it wants committed.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutorReply {
    pub thought: String,
    #[serde(default)]
    pub execution_operations: Vec<ProposedAction>,
    #[serde(default)]
    pub is_subtask_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub staged_causal_nodes: Vec<StagedCausalNode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Passed,
    Failed,
    Inconclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AuditResult {
    pub status: AuditStatus,
    /// How the completion criteria were (or were not) met.
    pub completion_check: String,
    #[serde(default)]
    pub logic_issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FailureAttribution {
    pub level: crate::graph::FailureLevel,
    pub rationale: String,
}

/// Reflector output: the audit verdict, belief-graph commits, and the
/// operation-level accomplishment claim.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReflectorReply {
    pub audit_result: AuditResult,
    #[serde(default)]
    pub causal_graph_updates: Vec<GraphCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_attribution: Option<FailureAttribution>,
    #[serde(default)]
    pub global_mission_accomplished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_intelligence: Option<String>,
}

/// Render the JSON schema for a reply type, for embedding in prompts.
pub fn schema_text<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}

/// Event payloads elide bodies beyond this size; the full text still
/// reaches the model, only the published copy is clipped.
const EVENT_BODY_LIMIT: usize = 2_000;

/// Role-parameterized structured ask.
///
/// Sends the prompt, validates the reply against `T`, and retries up to
/// `validation_retries` times with the validator's error appended to the
/// prompt. Every request and reply is published on the operation topic.
pub async fn ask<T: DeserializeOwned + JsonSchema>(
    client: &dyn LlmClient,
    ctx: &OpContext,
    role: Role,
    prompt: &str,
    validation_retries: u32,
) -> Result<T> {
    let mut current = prompt.to_string();
    let mut last_error = String::new();

    for attempt in 0..=validation_retries {
        ctx.emit_role(
            crate::broker::EventKind::LlmRequest,
            role,
            json!({
                "attempt": attempt,
                "prompt": crate::utils::truncate_with_marker(&current, EVENT_BODY_LIMIT),
            }),
        );

        let raw = client.complete(role, &current).await?;

        ctx.emit_role(
            crate::broker::EventKind::LlmResponse,
            role,
            json!({
                "attempt": attempt,
                "reply": crate::utils::truncate_with_marker(&raw, EVENT_BODY_LIMIT),
            }),
        );

        match parse_reply::<T>(&raw) {
            Ok(parsed) => return Ok(parsed),
            Err(err) => {
                debug!(%role, attempt, error = %err, "reply failed validation");
                last_error = err;
                current = format!(
                    "{}\n\nYour previous reply was invalid: {}\nReply again with JSON matching \
                     the schema exactly.",
                    prompt, last_error
                );
            }
        }
    }

    Err(RedpilotError::Validation {
        attempts: validation_retries + 1,
        detail: last_error,
    })
}

/// Extract and deserialize the JSON object from a raw model reply.
///
/// Models wrap JSON in prose and code fences often enough that we scan for
/// the outermost object instead of trusting the whole body.
pub fn parse_reply<T: DeserializeOwned>(raw: &str) -> std::result::Result<T, String> {
    let candidate = extract_json(raw).ok_or_else(|| "no JSON object found in reply".to_string())?;
    serde_json::from_str(candidate).map_err(|e| e.to_string())
}

fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_strips_fences_and_prose() {
        let raw = "Here is my plan:\n```json\n{\"thought\": \"t\", \"graph_operations\": [], \
                   \"goal_achieved\": false}\n```";
        let reply: PlannerReply = parse_reply(raw).unwrap();
        assert_eq!(reply.thought, "t");
        assert!(!reply.goal_achieved);
    }

    #[test]
    fn parse_reply_rejects_non_json() {
        assert!(parse_reply::<PlannerReply>("I could not decide.").is_err());
    }

    #[test]
    fn executor_reply_defaults() {
        let reply: ExecutorReply =
            parse_reply("{\"thought\": \"probing\", \"execution_operations\": []}").unwrap();
        assert!(!reply.is_subtask_complete);
        assert!(reply.staged_causal_nodes.is_empty());
    }

    #[test]
    fn schema_text_mentions_fields() {
        let schema = schema_text::<ReflectorReply>();
        assert!(schema.contains("audit_result"));
        assert!(schema.contains("global_mission_accomplished"));
    }

    #[test]
    fn reflector_reply_parses_attribution() {
        let raw = r#"{
            "audit_result": {"status": "failed", "completion_check": "no flag", "logic_issues": []},
            "failure_attribution": {"level": "L2", "rationale": "wrong tool arguments"},
            "global_mission_accomplished": false
        }"#;
        let reply: ReflectorReply = parse_reply(raw).unwrap();
        assert_eq!(reply.audit_result.status, AuditStatus::Failed);
        assert_eq!(
            reply.failure_attribution.unwrap().level,
            crate::graph::FailureLevel::L2
        );
    }
}
