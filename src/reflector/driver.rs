use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};

use crate::config::ReflectorConfig;
use crate::error::{RedpilotError, Result};
use crate::executor::{ExecVerdict, SubtaskOutcome};
use crate::graph::{summary, CausalKind, FailureLevel, GraphCommand, GraphStore};
use crate::llm::{
    ask, schema_text, AuditStatus, FailureAttribution, LlmClient, ReflectorReply, Role,
};
use crate::operation::OpContext;
use crate::utils::truncate_with_marker;

use super::memory::ReflectionMemory;

/// What the scheduler needs from one audit.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub task_id: String,
    pub audit: AuditStatus,
    pub attribution: Option<FailureAttribution>,
    pub mission_accomplished: bool,
    /// A confirmed vulnerability landed in this commit; together with the
    /// accomplishment claim this is the hard veto.
    pub confirmed_vulnerability: bool,
}

/// Audits one finished subtask: checks the completion claim against the
/// transcript, commits the staged beliefs it accepts, and attributes
/// failures.
pub struct Reflector {
    config: ReflectorConfig,
    validation_retries: u32,
    reflected: HashSet<String>,
    pub memory: ReflectionMemory,
}

impl Reflector {
    pub fn new(config: ReflectorConfig, validation_retries: u32) -> Self {
        Self {
            config,
            validation_retries,
            reflected: HashSet::new(),
            memory: ReflectionMemory::default(),
        }
    }

    pub fn inconclusive_replan_due(&self) -> bool {
        self.memory.consecutive_inconclusive() >= self.config.inconclusive_replan_threshold
    }

    /// A retried task terminates again and earns a fresh audit; without
    /// this the once-only guard would silently swallow it.
    pub fn allow_re_reflection(&mut self, task_id: &str) {
        self.reflected.remove(task_id);
    }

    /// Reflect exactly once per task termination; a second call for the
    /// same task is a no-op.
    pub async fn reflect(
        &mut self,
        llm: &dyn LlmClient,
        ctx: &OpContext,
        store: &GraphStore,
        outcome: &SubtaskOutcome,
    ) -> Result<Option<Reflection>> {
        if !self.reflected.insert(outcome.task_id.clone()) {
            return Ok(None);
        }

        let prompt = self.build_prompt(store, outcome);
        let reply: ReflectorReply =
            match ask(llm, ctx, Role::Reflector, &prompt, self.validation_retries).await {
                Ok(reply) => reply,
                Err(RedpilotError::Validation { detail, .. }) => {
                    warn!(task_id = %outcome.task_id, "reflector reply never validated");
                    self.synthetic_reply(FailureLevel::L3, format!("audit unparseable: {}", detail))
                }
                Err(RedpilotError::Transport(err)) => {
                    warn!(task_id = %outcome.task_id, error = %err, "reflector unreachable");
                    self.synthetic_reply(FailureLevel::L1, format!("reflector transport: {}", err))
                }
                Err(other) => return Err(other),
            };

        let mut confirmed_vulnerability = false;
        if !reply.causal_graph_updates.is_empty() {
            match ctx.commit(store, &reply.causal_graph_updates, "reflector") {
                Ok(_) => {
                    confirmed_vulnerability = commits_confirmed_vulnerability(&reply.causal_graph_updates);
                }
                Err(e) => {
                    // The audit verdict stands even when the belief commit
                    // is refused; the rejection is already on the topic.
                    warn!(task_id = %outcome.task_id, error = %e, "causal commit rejected");
                }
            }
        }

        if let Some(intel) = &reply.attack_intelligence {
            self.attach_intelligence(ctx, store, &outcome.task_id, intel);
        }

        let pattern = reply
            .failure_attribution
            .as_ref()
            .map(|a| a.rationale.as_str());
        self.memory
            .record(&outcome.task_id, reply.audit_result.status, pattern);

        info!(
            op_id = %ctx.op_id,
            task_id = %outcome.task_id,
            status = ?reply.audit_result.status,
            mission_accomplished = reply.global_mission_accomplished,
            "reflection committed"
        );

        Ok(Some(Reflection {
            task_id: outcome.task_id.clone(),
            audit: reply.audit_result.status,
            attribution: reply.failure_attribution,
            mission_accomplished: reply.global_mission_accomplished,
            confirmed_vulnerability,
        }))
    }

    /// Deterministic stand-in when the reflector itself is broken, per the
    /// error-propagation policy: transport exhaustion audits as L1,
    /// validation exhaustion as L3.
    fn synthetic_reply(&self, level: FailureLevel, rationale: String) -> ReflectorReply {
        ReflectorReply {
            audit_result: crate::llm::AuditResult {
                status: AuditStatus::Failed,
                completion_check: rationale.clone(),
                logic_issues: Vec::new(),
            },
            causal_graph_updates: Vec::new(),
            failure_attribution: Some(FailureAttribution { level, rationale }),
            global_mission_accomplished: false,
            attack_intelligence: None,
        }
    }

    fn attach_intelligence(
        &self,
        ctx: &OpContext,
        store: &GraphStore,
        task_id: &str,
        intel: &str,
    ) {
        let view = store.snapshot();
        let Some(task) = view.tasks.get(task_id) else {
            return;
        };
        let mut artifacts = task.artifacts.clone();
        artifacts.push(json!({ "attack_intelligence": intel }));
        let batch = vec![GraphCommand::UpdateNode {
            id: task_id.to_string(),
            updates: json!({ "artifacts": artifacts })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }];
        if let Err(e) = ctx.commit(store, &batch, "reflector") {
            warn!(task_id, error = %e, "could not attach attack intelligence");
        }
    }

    fn build_prompt(&self, store: &GraphStore, outcome: &SubtaskOutcome) -> String {
        let view = store.snapshot();
        let task_line = view
            .tasks
            .get(&outcome.task_id)
            .map(|t| {
                format!(
                    "{}: {}\nCompletion criteria: {}",
                    t.id,
                    t.description,
                    if t.completion_criteria.is_empty() {
                        "(none given)"
                    } else {
                        &t.completion_criteria
                    }
                )
            })
            .unwrap_or_else(|| outcome.task_id.clone());

        let verdict = match &outcome.verdict {
            ExecVerdict::Completed { summary } => format!(
                "executor claims completion: {}",
                summary.as_deref().unwrap_or("(no summary)")
            ),
            ExecVerdict::Failed { reason, .. } => format!("executor failed: {}", reason),
            ExecVerdict::Stalled { reason } => format!("executor stalled: {}", reason),
            ExecVerdict::Aborted => "executor aborted".to_string(),
        };

        let staged = if outcome.staged.is_empty() {
            "(none)".to_string()
        } else {
            serde_json::to_string_pretty(&outcome.staged).unwrap_or_else(|_| "(unserializable)".into())
        };

        format!(
            "Audit this subtask.\n\nSubtask: {}\nTermination: {}\nSteps executed: {}\n\n\
             Execution transcript:\n{}\n\nStaged causal nodes (candidates; commit the ones \
             the transcript actually supports via causal_graph_updates):\n{}\n\nCurrent \
             belief graph:\n{}\n\nJudge whether the completion criteria are genuinely met. \
             When the audit fails, attribute the failure level L0..L5. Set \
             global_mission_accomplished only if the operation's overall goal is now \
             demonstrably achieved.\n\nReply with JSON matching this schema:\n{}",
            task_line,
            verdict,
            outcome.steps,
            truncate_with_marker(&outcome.transcript, self.config.transcript_budget),
            staged,
            summary::render_causal_graph(&view, 4_000),
            schema_text::<ReflectorReply>()
        )
    }
}

/// Does this batch introduce or promote to a confirmed vulnerability?
fn commits_confirmed_vulnerability(batch: &[GraphCommand]) -> bool {
    batch.iter().any(|cmd| match cmd {
        GraphCommand::AddCausalNode { variant, .. } => {
            *variant == CausalKind::ConfirmedVulnerability
        }
        GraphCommand::UpdateNode { updates, .. } => updates
            .get("kind")
            .and_then(|v| v.as_str())
            .map(|k| k == "confirmed_vulnerability")
            .unwrap_or(false),
        _ => false,
    })
}
