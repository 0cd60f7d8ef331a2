use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::broker::EventKind;
use crate::config::ExecutorConfig;
use crate::error::RedpilotError;
use crate::graph::{
    summary, FailureLevel, GraphCommand, GraphStore, GraphView, NodeDraft, NodeKind, TaskNode,
};
use crate::llm::{ask, schema_text, ExecutorReply, LlmClient, Role, StagedCausalNode};
use crate::operation::OpContext;
use crate::tools::{ToolHost, ToolSpec};
use crate::utils::truncate_with_marker;

use super::history::{Speaker, StepHistory};
use super::repeat::{canonical_action_key, RepeatTracker};

/// Meta-tool the model may invoke to bail out of a subtask on purpose.
const HALT_TOOL: &str = "halt_task";

/// How one subtask's step loop ended, before the reflector's audit.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecVerdict {
    /// The model declared completion.
    Completed { summary: Option<String> },
    /// The loop gave up; `presumed_level` is a pre-audit attribution hint.
    Failed {
        reason: String,
        presumed_level: Option<FailureLevel>,
    },
    /// No forward progress, or an explicit halt.
    Stalled { reason: String },
    /// Cancellation arrived mid-loop.
    Aborted,
}

/// Handoff package for the reflector.
#[derive(Debug, Clone)]
pub struct SubtaskOutcome {
    pub task_id: String,
    pub verdict: ExecVerdict,
    pub staged: Vec<StagedCausalNode>,
    pub transcript: String,
    pub steps: usize,
}

/// Drives one subtask to termination: propose action, invoke tool, append
/// the observation, loop. Stateless between subtasks, so N executors can
/// run concurrently, one per dispatched task.
pub struct Executor {
    config: ExecutorConfig,
    validation_retries: u32,
    tool_deadline: Duration,
}

impl Executor {
    pub fn new(config: ExecutorConfig, validation_retries: u32, tool_deadline: Duration) -> Self {
        Self {
            config,
            validation_retries,
            tool_deadline,
        }
    }

    pub async fn run_subtask(
        &self,
        llm: &dyn LlmClient,
        tools: &dyn ToolHost,
        ctx: &OpContext,
        store: &GraphStore,
        task_id: &str,
        cancel: watch::Receiver<bool>,
    ) -> SubtaskOutcome {
        let view = store.snapshot();
        let Some(task) = view.tasks.get(task_id).cloned() else {
            return SubtaskOutcome {
                task_id: task_id.to_string(),
                verdict: ExecVerdict::Failed {
                    reason: format!("task {} not found in graph", task_id),
                    presumed_level: Some(FailureLevel::L5),
                },
                staged: Vec::new(),
                transcript: String::new(),
                steps: 0,
            };
        };

        let tool_specs = match tools.list_tools().await {
            Ok(specs) => specs,
            Err(e) => {
                return self.finish(
                    task_id,
                    ExecVerdict::Failed {
                        reason: format!("tool discovery failed: {}", e),
                        presumed_level: Some(FailureLevel::L1),
                    },
                    Vec::new(),
                    None,
                    0,
                );
            }
        };

        let briefing = self.build_briefing(&task, &view, &tool_specs);
        let mut history = StepHistory::new(self.config.history.clone(), briefing);
        let mut tracker = RepeatTracker::new(self.config.repeat_threshold);
        let mut staged: Vec<StagedCausalNode> = Vec::new();
        let mut steps = 0usize;
        let mut idle_steps = 0usize;

        loop {
            if *cancel.borrow() {
                return self.finish(task_id, ExecVerdict::Aborted, staged, Some(&history), steps);
            }

            self.maybe_compress(llm, &mut history).await;

            let prompt = self.step_prompt(&history);
            let reply: ExecutorReply =
                match ask(llm, ctx, Role::Executor, &prompt, self.validation_retries).await {
                    Ok(reply) => reply,
                    Err(RedpilotError::Validation { detail, .. }) => {
                        return self.finish(
                            task_id,
                            ExecVerdict::Failed {
                                reason: format!("executor reply never validated: {}", detail),
                                presumed_level: Some(FailureLevel::L3),
                            },
                            staged,
                            Some(&history),
                            steps,
                        );
                    }
                    Err(RedpilotError::Cancelled(_)) => {
                        return self.finish(
                            task_id,
                            ExecVerdict::Aborted,
                            staged,
                            Some(&history),
                            steps,
                        );
                    }
                    Err(e) => {
                        return self.finish(
                            task_id,
                            ExecVerdict::Failed {
                                reason: format!("executor model unavailable: {}", e),
                                presumed_level: Some(FailureLevel::L1),
                            },
                            staged,
                            Some(&history),
                            steps,
                        );
                    }
                };

            history.push(Speaker::Assistant, reply.thought.clone());
            let newly_staged = !reply.staged_causal_nodes.is_empty();
            staged.extend(reply.staged_causal_nodes);

            if reply.is_subtask_complete {
                info!(op_id = %ctx.op_id, task_id, steps, "subtask reported complete");
                return self.finish(
                    task_id,
                    ExecVerdict::Completed {
                        summary: reply.summary,
                    },
                    staged,
                    Some(&history),
                    steps,
                );
            }

            if reply.execution_operations.is_empty() {
                if newly_staged {
                    idle_steps = 0;
                } else {
                    idle_steps += 1;
                    if idle_steps >= self.config.no_progress_patience {
                        return self.finish(
                            task_id,
                            ExecVerdict::Stalled {
                                reason: format!(
                                    "{} consecutive steps without actions or new findings",
                                    idle_steps
                                ),
                            },
                            staged,
                            Some(&history),
                            steps,
                        );
                    }
                }
                history.push(
                    Speaker::Observation,
                    "No action proposed. Either propose a tool call or declare the subtask complete.",
                );
                continue;
            }
            idle_steps = 0;

            for action in &reply.execution_operations {
                if *cancel.borrow() {
                    return self.finish(
                        task_id,
                        ExecVerdict::Aborted,
                        staged,
                        Some(&history),
                        steps,
                    );
                }

                if action.tool == HALT_TOOL {
                    let reason = action.params["reason"]
                        .as_str()
                        .unwrap_or("halted by executor")
                        .to_string();
                    return self.finish(
                        task_id,
                        ExecVerdict::Stalled {
                            reason: format!("{}: {}", HALT_TOOL, reason),
                        },
                        staged,
                        Some(&history),
                        steps,
                    );
                }

                steps += 1;
                history.note_step();

                let action_id = self.record_action_start(ctx, store, &view, task_id, action);
                let key = canonical_action_key(&action.tool, &action.params);

                let call = tools.call_tool(&action.tool, &action.params, self.tool_deadline);
                let outcome = tokio::select! {
                    result = call => result,
                    _ = cancelled(cancel.clone()) => {
                        if let Some(id) = &action_id {
                            self.record_action_end(ctx, store, id, "aborted", "", "cancelled");
                        }
                        return self.finish(
                            task_id,
                            ExecVerdict::Aborted,
                            staged,
                            Some(&history),
                            steps,
                        );
                    }
                };

                let (success, observation) = match outcome {
                    Ok(tool_outcome) => {
                        let success = tool_outcome.is_success();
                        (success, tool_outcome.observation())
                    }
                    Err(e) => (false, format!("tool transport failed: {}", e)),
                };

                let status = if success { "completed" } else { "failed" };
                if let Some(id) = &action_id {
                    self.record_action_end(ctx, store, id, status, &action.tool, &observation);
                }
                ctx.emit(
                    EventKind::ExecutionStepCompleted,
                    json!({
                        "task_id": task_id,
                        "action_id": &action_id,
                        "tool": &action.tool,
                        "ok": success,
                    }),
                );

                history.push(
                    Speaker::Observation,
                    format!(
                        "{} -> {}",
                        action.tool,
                        truncate_with_marker(&observation, 4_000)
                    ),
                );

                if tracker.record(key, success) {
                    return self.finish(
                        task_id,
                        ExecVerdict::Failed {
                            reason: format!(
                                "action `{}` failed {} consecutive times with identical arguments",
                                action.tool, self.config.repeat_threshold
                            ),
                            presumed_level: Some(FailureLevel::L2),
                        },
                        staged,
                        Some(&history),
                        steps,
                    );
                }

                if steps >= self.config.max_steps {
                    return self.finish(
                        task_id,
                        ExecVerdict::Failed {
                            reason: format!("step budget ({}) exhausted", self.config.max_steps),
                            presumed_level: Some(FailureLevel::L4),
                        },
                        staged,
                        Some(&history),
                        steps,
                    );
                }
            }
        }
    }

    fn finish(
        &self,
        task_id: &str,
        verdict: ExecVerdict,
        staged: Vec<StagedCausalNode>,
        history: Option<&StepHistory>,
        steps: usize,
    ) -> SubtaskOutcome {
        SubtaskOutcome {
            task_id: task_id.to_string(),
            verdict,
            staged,
            transcript: history.map(|h| h.render()).unwrap_or_default(),
            steps,
        }
    }

    async fn maybe_compress(&self, llm: &dyn LlmClient, history: &mut StepHistory) {
        if !history.needs_compression() {
            return;
        }
        let prompt = format!(
            "Summarize the following execution observations into a dense factual digest. \
             Keep hostnames, ports, credentials, payloads and error messages verbatim. \
             Reply with the summary text only.\n\n{}",
            history.compressible_text()
        );
        match llm.complete(Role::Executor, &prompt).await {
            Ok(summary) => {
                debug!(bytes = history.byte_len(), "history compressed");
                history.apply_compression(summary);
            }
            Err(e) => warn!(error = %e, "history compression failed, keeping full history"),
        }
    }

    /// Append the action node and mark it in progress. Returns `None` when
    /// the graph refuses the action (e.g. the parent task went terminal).
    fn record_action_start(
        &self,
        ctx: &OpContext,
        store: &GraphStore,
        view: &GraphView,
        task_id: &str,
        action: &crate::llm::ProposedAction,
    ) -> Option<String> {
        let supplied = action
            .node_id
            .clone()
            .filter(|id| !id.is_empty() && !view.tasks.contains_key(id));
        let action_id = supplied
            .unwrap_or_else(|| format!("act-{}", &uuid::Uuid::new_v4().to_string()[..8]));

        let draft = NodeDraft {
            id: action_id.clone(),
            kind: NodeKind::Action,
            description: format!("invoke {}", action.tool),
            completion_criteria: String::new(),
            dependencies: Vec::new(),
            parent: Some(task_id.to_string()),
            tool_name: Some(action.tool.clone()),
            tool_args: Some(action.params.clone()),
        };
        let batch = vec![
            GraphCommand::AddNode { node_data: draft },
            GraphCommand::UpdateNode {
                id: action_id.clone(),
                updates: as_object(json!({ "status": "in_progress" })),
            },
        ];
        match ctx.commit(store, &batch, "executor") {
            Ok(_) => Some(action_id),
            Err(e) => {
                warn!(task_id, error = %e, "could not record action node");
                None
            }
        }
    }

    fn record_action_end(
        &self,
        ctx: &OpContext,
        store: &GraphStore,
        action_id: &str,
        status: &str,
        result: &str,
        observation: &str,
    ) {
        let batch = vec![GraphCommand::UpdateNode {
            id: action_id.to_string(),
            updates: as_object(json!({
                "status": status,
                "result": result,
                "observation": truncate_with_marker(observation, 8_000),
            })),
        }];
        if let Err(e) = ctx.commit(store, &batch, "executor") {
            warn!(action_id, error = %e, "could not finalize action node");
        }
    }

    fn build_briefing(&self, task: &TaskNode, view: &GraphView, tools: &[ToolSpec]) -> String {
        let tool_lines = if tools.is_empty() {
            "(no tools available)".to_string()
        } else {
            tools
                .iter()
                .map(|t| t.render_line())
                .collect::<Vec<_>>()
                .join("\n")
        };

        format!(
            "Subtask {}: {}\nCompletion criteria: {}\n\nDependency results:\n{}\n\n\
             Known beliefs relevant to this subtask:\n{}\n\nAvailable tools:\n{}\n- {}: \
             give up on this subtask; params: {{\"reason\": \"...\"}}",
            task.id,
            task.description,
            if task.completion_criteria.is_empty() {
                "(none given)"
            } else {
                &task.completion_criteria
            },
            summary::dependency_briefing(view, &task.id, 4_000),
            summary::relevant_causal_context(view, &task.id, 4_000),
            tool_lines,
            HALT_TOOL,
        )
    }

    fn step_prompt(&self, history: &StepHistory) -> String {
        format!(
            "{}\n\nDecide the next step. Either propose tool calls in execution_operations, \
             or set is_subtask_complete with a summary and stage the causal nodes (key facts, \
             evidence, hypotheses) your work established.\n\nReply with JSON matching this \
             schema:\n{}",
            history.render(),
            schema_text::<ExecutorReply>()
        )
    }
}

fn as_object(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Resolves only when the abort flag actually flips. A dropped sender
/// means no abort can ever arrive, so the in-flight call must win the
/// race instead of being cut short.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
