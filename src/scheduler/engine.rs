use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::broker::{EventKind, Phase};
use crate::config::{OperationConfig, RedpilotConfig};
use crate::error::RedpilotError;
use crate::executor::{ExecVerdict, Executor, SubtaskOutcome};
use crate::graph::{summary, FailureLevel, GraphCommand, GraphStore, NodeStatus};
use crate::guidance::GuidanceSource;
use crate::intervention::{Decision, InterventionGate};
use crate::llm::{AuditStatus, LlmClient};
use crate::operation::{OpContext, OperationStatus};
use crate::persist::{CheckpointStore, OperationCheckpoint};
use crate::planner::Planner;
use crate::reflector::Reflector;
use crate::tools::ToolHost;

use super::signal::AbortSignal;

/// What one reflected outcome means for the loop.
enum Flow {
    Continue,
    Replan,
    Succeed,
    Abort,
    Fail(FailureLevel, String),
}

/// The per-operation control flow: plan, gate, apply, dispatch up to the
/// fanout limit, reflect each completion as it lands, and decide between
/// continuing, re-planning and terminating.
pub struct Scheduler {
    ctx: OpContext,
    store: Arc<GraphStore>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolHost>,
    guidance: Arc<dyn GuidanceSource>,
    gate: Arc<InterventionGate>,
    signal: Arc<AbortSignal>,
    planner: Planner,
    reflector: Reflector,
    executor: Arc<Executor>,
    operation: OperationConfig,
    status: Arc<RwLock<OperationStatus>>,
    checkpoints: Option<Arc<CheckpointStore>>,
    reflections_since_checkpoint: usize,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: OpContext,
        store: Arc<GraphStore>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolHost>,
        guidance: Arc<dyn GuidanceSource>,
        gate: Arc<InterventionGate>,
        signal: Arc<AbortSignal>,
        status: Arc<RwLock<OperationStatus>>,
        checkpoints: Option<Arc<CheckpointStore>>,
        config: &RedpilotConfig,
    ) -> Self {
        let planner = Planner::new(config.planner.clone(), config.llm.validation_retries);
        let reflector = Reflector::new(config.reflector.clone(), config.llm.validation_retries);
        let executor = Arc::new(Executor::new(
            config.executor.clone(),
            config.llm.validation_retries,
            Duration::from_secs(config.tools.call_timeout_secs),
        ));
        Self {
            ctx,
            store,
            llm,
            tools,
            guidance,
            gate,
            signal,
            planner,
            reflector,
            executor,
            operation: config.operation.clone(),
            status,
            checkpoints,
            reflections_since_checkpoint: 0,
        }
    }

    pub async fn run(mut self) -> OperationStatus {
        *self.status.write() = OperationStatus::Running;
        let mut recent_failures: Vec<String> = Vec::new();
        let mut total_steps = 0usize;
        let mut revisions = 0u32;
        let mut idle_plan_rounds = 0u32;

        loop {
            if self.signal.is_aborted() {
                return self.finalize_aborted(JoinSet::new(), HashSet::new()).await;
            }
            self.ctx.emit(EventKind::Heartbeat, Value::Null);

            // PLAN
            self.ctx
                .emit(EventKind::PhaseChanged, json!({ "phase": Phase::Planning }));
            let view = self.store.snapshot();
            let reply = match self
                .planner
                .plan(
                    self.llm.as_ref(),
                    self.guidance.as_ref(),
                    &self.ctx,
                    &view,
                    &recent_failures,
                )
                .await
            {
                Ok(reply) => reply,
                Err(RedpilotError::Validation { detail, .. }) => {
                    return self
                        .finalize_stalled(format!("planner reply never validated: {}", detail))
                        .await;
                }
                Err(RedpilotError::Transport(err)) => {
                    return self
                        .finalize_stalled(format!("planner unreachable: {}", err))
                        .await;
                }
                Err(RedpilotError::Cancelled(_)) => {
                    return self.finalize_aborted(JoinSet::new(), HashSet::new()).await;
                }
                Err(other) => {
                    return self
                        .finalize_failed(FailureLevel::L5, other.to_string(), JoinSet::new(), HashSet::new())
                        .await;
                }
            };

            if reply.goal_achieved {
                self.planner.memory.set_latest_outcome("goal achieved");
                return self.finalize_success(JoinSet::new(), HashSet::new()).await;
            }

            if reply.graph_operations.is_empty() {
                // An empty batch with the goal unmet is a stall, never a
                // dispatch.
                self.planner.memory.set_latest_outcome("empty batch");
                return self
                    .finalize_stalled("planner produced an empty batch with the goal unmet")
                    .await;
            }

            // Staging: structurally invalid commands never reach the gate;
            // the planner revises them first.
            let staging_errors = crate::graph::validate_batch(&reply.graph_operations);
            if !staging_errors.is_empty() {
                let digest = staging_errors
                    .iter()
                    .map(|r| format!("#{} {}: {}", r.index, r.reason, r.detail))
                    .collect::<Vec<_>>()
                    .join("; ");
                self.planner.memory.set_latest_outcome("failed staging validation");
                recent_failures.push(format!("plan failed validation: {}", digest));
                revisions += 1;
                if revisions > self.planner.max_revisions() {
                    return self
                        .finalize_stalled("planner kept producing invalid batches")
                        .await;
                }
                continue;
            }

            // GATE
            let decision = self
                .gate
                .await_decision(&self.ctx, reply.graph_operations.clone())
                .await;
            let batch = match decision {
                Decision::Rejected { reason } => {
                    if self.signal.is_aborted() {
                        return self.finalize_aborted(JoinSet::new(), HashSet::new()).await;
                    }
                    self.planner
                        .memory
                        .reject_strategy(reply.thought.clone(), reason.clone());
                    self.planner
                        .memory
                        .set_latest_outcome(format!("rejected: {}", reason));
                    recent_failures.push(format!("operator rejected the plan: {}", reason));
                    revisions += 1;
                    if revisions > self.planner.max_revisions() {
                        return self.finalize_stalled("plan rejected repeatedly").await;
                    }
                    continue;
                }
                Decision::Approved(batch) | Decision::Modified(batch) => batch,
            };

            // APPLY
            match self.ctx.commit(self.store.as_ref(), &batch, "planner") {
                Ok(outcome) => {
                    debug!(op_id = %self.ctx.op_id, applied = outcome.applied, "plan applied");
                    self.planner.memory.set_latest_outcome("applied");
                    revisions = 0;
                }
                Err(RedpilotError::Invariant(rejections)) => {
                    let digest = rejections
                        .iter()
                        .map(|r| format!("#{} {}: {}", r.index, r.reason, r.detail))
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.planner.memory.set_latest_outcome("rejected by graph store");
                    recent_failures.push(format!("graph rejected the batch: {}", digest));
                    revisions += 1;
                    if revisions > self.planner.max_revisions() {
                        return self
                            .finalize_stalled("graph rejected the plan repeatedly")
                            .await;
                    }
                    continue;
                }
                Err(other) => {
                    return self
                        .finalize_failed(FailureLevel::L5, other.to_string(), JoinSet::new(), HashSet::new())
                        .await;
                }
            }
            self.persist_checkpoint().await;

            // DISPATCH / EXECUTE / REFLECT
            let mut workers: JoinSet<SubtaskOutcome> = JoinSet::new();
            let mut in_flight: HashSet<String> = HashSet::new();
            let mut replan = false;
            let mut outcomes_seen = 0usize;

            loop {
                if self.signal.is_aborted() {
                    return self.finalize_aborted(workers, in_flight).await;
                }

                if !replan {
                    let started = self.dispatch(&mut workers, &mut in_flight);
                    if started > 0 {
                        self.ctx
                            .emit(EventKind::PhaseChanged, json!({ "phase": Phase::Executing }));
                    }
                }

                if workers.is_empty() {
                    break;
                }

                // Completion aggregation: take the first finisher, reflect
                // it, and loop straight back into dispatch.
                let joined = workers.join_next().await.expect("workers non-empty");
                let outcome = match joined {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        warn!(op_id = %self.ctx.op_id, error = %e, "executor worker died");
                        continue;
                    }
                };
                in_flight.remove(&outcome.task_id);
                total_steps += outcome.steps;
                outcomes_seen += 1;

                self.ctx
                    .emit(EventKind::PhaseChanged, json!({ "phase": Phase::Reflecting }));
                match self
                    .handle_outcome(outcome, &mut workers, &mut in_flight, &mut recent_failures)
                    .await
                {
                    Flow::Continue => {}
                    Flow::Replan => replan = true,
                    Flow::Succeed => return self.finalize_success(workers, in_flight).await,
                    Flow::Abort => return self.finalize_aborted(workers, in_flight).await,
                    Flow::Fail(level, rationale) => {
                        return self.finalize_failed(level, rationale, workers, in_flight).await;
                    }
                }

                if total_steps >= self.operation.step_budget {
                    return self
                        .finalize_failed(
                            FailureLevel::L4,
                            format!("operation step budget ({}) exhausted", self.operation.step_budget),
                            workers,
                            in_flight,
                        )
                        .await;
                }
            }

            // Back to PLAN. Guard against planning rounds that never yield
            // an executable task.
            if outcomes_seen == 0 {
                idle_plan_rounds += 1;
                if idle_plan_rounds > self.planner.max_revisions() {
                    return self
                        .finalize_stalled("planning keeps producing no dispatchable work")
                        .await;
                }
            } else {
                idle_plan_rounds = 0;
            }
            recent_failures = summary::recent_failures(&self.store.snapshot(), 5);
        }
    }

    /// Start executor workers for every ready task while slots remain.
    fn dispatch(
        &self,
        workers: &mut JoinSet<SubtaskOutcome>,
        in_flight: &mut HashSet<String>,
    ) -> usize {
        let mut started = 0;
        for task_id in self.store.ready_tasks() {
            if in_flight.len() >= self.operation.max_parallel {
                break;
            }
            if in_flight.contains(&task_id) {
                continue;
            }
            let batch = vec![GraphCommand::UpdateNode {
                id: task_id.clone(),
                updates: as_object(json!({ "status": "in_progress" })),
            }];
            if let Err(e) = self.ctx.commit(self.store.as_ref(), &batch, "scheduler") {
                warn!(%task_id, error = %e, "could not dispatch task");
                continue;
            }
            self.spawn_worker(workers, in_flight, task_id);
            started += 1;
        }
        started
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<SubtaskOutcome>,
        in_flight: &mut HashSet<String>,
        task_id: String,
    ) {
        info!(op_id = %self.ctx.op_id, %task_id, "dispatching executor worker");
        in_flight.insert(task_id.clone());
        let executor = self.executor.clone();
        let llm = self.llm.clone();
        let tools = self.tools.clone();
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let cancel = self.signal.subscribe();
        workers.spawn(async move {
            executor
                .run_subtask(llm.as_ref(), tools.as_ref(), &ctx, &store, &task_id, cancel)
                .await
        });
    }

    /// Route one finished subtask through the reflector and the failure
    /// matrix: L0/L1 retry in place, L2 re-plans the parent, L3/L4
    /// re-plan the operation, L5 kills it.
    async fn handle_outcome(
        &mut self,
        outcome: SubtaskOutcome,
        workers: &mut JoinSet<SubtaskOutcome>,
        in_flight: &mut HashSet<String>,
        recent_failures: &mut Vec<String>,
    ) -> Flow {
        if outcome.verdict == ExecVerdict::Aborted {
            self.set_task_status(&outcome.task_id, NodeStatus::Aborted, None);
            return Flow::Continue;
        }

        let presumed_level = match &outcome.verdict {
            ExecVerdict::Failed { presumed_level, .. } => *presumed_level,
            _ => None,
        };
        let verdict_reason = match &outcome.verdict {
            ExecVerdict::Failed { reason, .. } | ExecVerdict::Stalled { reason } => reason.clone(),
            _ => String::new(),
        };

        let reflection = match self
            .reflector
            .reflect(self.llm.as_ref(), &self.ctx, self.store.as_ref(), &outcome)
            .await
        {
            Ok(Some(reflection)) => reflection,
            Ok(None) => return Flow::Continue,
            Err(RedpilotError::Cancelled(_)) => return Flow::Abort,
            Err(e) => {
                self.set_task_status(&outcome.task_id, NodeStatus::Failed, Some(FailureLevel::L5));
                return Flow::Fail(FailureLevel::L5, e.to_string());
            }
        };
        self.reflections_since_checkpoint += 1;

        let flow = match reflection.audit {
            AuditStatus::Passed => {
                self.set_task_status(&outcome.task_id, NodeStatus::Completed, None);
                Flow::Continue
            }
            AuditStatus::Inconclusive => {
                self.set_task_status(&outcome.task_id, NodeStatus::Stalled, None);
                if self.reflector.inconclusive_replan_due() {
                    info!(op_id = %self.ctx.op_id, "inconclusive streak reached, re-planning");
                    Flow::Replan
                } else {
                    Flow::Continue
                }
            }
            AuditStatus::Failed => {
                let level = reflection
                    .attribution
                    .as_ref()
                    .map(|a| a.level)
                    .or(presumed_level)
                    .unwrap_or(FailureLevel::L3);
                let rationale = reflection
                    .attribution
                    .as_ref()
                    .map(|a| a.rationale.clone())
                    .unwrap_or(verdict_reason);

                let retry_count = self
                    .store
                    .snapshot()
                    .tasks
                    .get(&outcome.task_id)
                    .map(|t| t.retry_count)
                    .unwrap_or(0);

                if level.auto_retry() && retry_count < self.operation.max_task_retries {
                    // Transient failure: the task stays in progress and the
                    // same subtask is re-run, with a fresh audit allowed.
                    info!(
                        op_id = %self.ctx.op_id,
                        task_id = %outcome.task_id,
                        %level,
                        retry = retry_count + 1,
                        "retrying subtask after transient failure"
                    );
                    let batch = vec![GraphCommand::UpdateNode {
                        id: outcome.task_id.clone(),
                        updates: as_object(json!({ "retry_count": retry_count + 1 })),
                    }];
                    if let Err(e) = self.ctx.commit(self.store.as_ref(), &batch, "scheduler") {
                        warn!(error = %e, "could not bump retry count");
                    }
                    self.reflector.allow_re_reflection(&outcome.task_id);
                    self.spawn_worker(workers, in_flight, outcome.task_id.clone());
                    Flow::Continue
                } else {
                    self.set_task_status(&outcome.task_id, NodeStatus::Failed, Some(level));
                    recent_failures.push(format!(
                        "{} failed [{}]: {}",
                        outcome.task_id, level, rationale
                    ));
                    if level.is_fatal() {
                        Flow::Fail(level, rationale)
                    } else if level.replans_parent() || level.replans_operation() {
                        Flow::Replan
                    } else {
                        Flow::Continue
                    }
                }
            }
        };

        if reflection.mission_accomplished {
            // Hard veto: still-ready tasks are ignored.
            info!(
                op_id = %self.ctx.op_id,
                confirmed_vulnerability = reflection.confirmed_vulnerability,
                "reflector confirmed mission accomplished"
            );
            return Flow::Succeed;
        }

        if self.checkpoint_due() {
            self.persist_checkpoint().await;
        }
        flow
    }

    fn checkpoint_due(&self) -> bool {
        self.operation.checkpoint_interval > 0
            && self.reflections_since_checkpoint >= self.operation.checkpoint_interval
    }

    /// Commit a terminal status, skipping nodes that already got one.
    fn set_task_status(&self, task_id: &str, status: NodeStatus, level: Option<FailureLevel>) {
        let view = self.store.snapshot();
        let Some(task) = view.tasks.get(task_id) else {
            return;
        };
        if task.status == status || task.status.is_terminal() {
            return;
        }
        let mut updates = json!({ "status": status });
        if let Some(level) = level {
            updates["failure_level"] = json!(level);
        }
        let batch = vec![GraphCommand::UpdateNode {
            id: task_id.to_string(),
            updates: as_object(updates),
        }];
        if let Err(e) = self.ctx.commit(self.store.as_ref(), &batch, "scheduler") {
            warn!(task_id, %status, error = %e, "could not set task status");
        }
    }

    /// Wait for in-flight workers within the grace period, then abandon
    /// whatever is left and record it as aborted.
    async fn drain_workers(
        &mut self,
        mut workers: JoinSet<SubtaskOutcome>,
        mut in_flight: HashSet<String>,
    ) {
        let grace = Duration::from_secs(self.operation.abort_grace_secs);
        let deadline = tokio::time::Instant::now() + grace;

        while !workers.is_empty() {
            match tokio::time::timeout_at(deadline, workers.join_next()).await {
                Ok(Some(Ok(outcome))) => {
                    in_flight.remove(&outcome.task_id);
                    self.set_task_status(&outcome.task_id, NodeStatus::Aborted, None);
                }
                Ok(Some(Err(_))) => continue,
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        op_id = %self.ctx.op_id,
                        stragglers = in_flight.len(),
                        "grace period elapsed, abandoning in-flight workers"
                    );
                    workers.abort_all();
                    break;
                }
            }
        }

        for task_id in in_flight {
            self.set_task_status(&task_id, NodeStatus::Aborted, None);
        }
    }

    async fn finalize_success(
        &mut self,
        workers: JoinSet<SubtaskOutcome>,
        in_flight: HashSet<String>,
    ) -> OperationStatus {
        self.signal.trigger();
        self.drain_workers(workers, in_flight).await;

        let root_id = self.store.snapshot().root_id.clone();
        let batch = vec![GraphCommand::UpdateNode {
            id: root_id,
            updates: as_object(json!({ "status": "completed", "mission_accomplished": true })),
        }];
        if let Err(e) = self.ctx.commit(self.store.as_ref(), &batch, "scheduler") {
            warn!(error = %e, "could not finalize root as completed");
        }

        self.ctx.emit(
            EventKind::MissionAccomplished,
            json!({ "goal": self.store.snapshot().goal() }),
        );
        self.set_status(OperationStatus::Succeeded).await
    }

    async fn finalize_aborted(
        &mut self,
        workers: JoinSet<SubtaskOutcome>,
        in_flight: HashSet<String>,
    ) -> OperationStatus {
        self.signal.trigger();
        self.gate.resolve_aborted();
        self.drain_workers(workers, in_flight).await;

        let view = self.store.snapshot();
        // Any non-terminal task is finalized as aborted.
        for task in view.tasks.values() {
            if !task.status.is_terminal() {
                self.set_task_status(&task.id, NodeStatus::Aborted, None);
            }
        }

        self.ctx.emit(EventKind::OperationAborted, Value::Null);
        self.set_status(OperationStatus::Aborted).await
    }

    async fn finalize_stalled(&mut self, reason: impl Into<String>) -> OperationStatus {
        let reason = reason.into();
        self.ctx.emit(
            EventKind::InterventionRequired,
            json!({ "kind": "stall", "reason": &reason }),
        );

        let root_id = self.store.snapshot().root_id.clone();
        self.set_task_status(&root_id, NodeStatus::Stalled, None);
        self.set_status(OperationStatus::Stalled { reason }).await
    }

    async fn finalize_failed(
        &mut self,
        level: FailureLevel,
        rationale: String,
        workers: JoinSet<SubtaskOutcome>,
        in_flight: HashSet<String>,
    ) -> OperationStatus {
        self.signal.trigger();
        self.drain_workers(workers, in_flight).await;

        let root_id = self.store.snapshot().root_id.clone();
        self.set_task_status(&root_id, NodeStatus::Failed, Some(level));
        self.set_status(OperationStatus::Failed { level, rationale }).await
    }

    async fn set_status(&mut self, status: OperationStatus) -> OperationStatus {
        *self.status.write() = status.clone();
        self.persist_checkpoint().await;
        info!(op_id = %self.ctx.op_id, %status, "operation finalized");
        status
    }

    async fn persist_checkpoint(&mut self) {
        let Some(checkpoints) = self.checkpoints.clone() else {
            return;
        };
        let view = self.store.snapshot();
        let checkpoint = OperationCheckpoint {
            op_id: self.ctx.op_id.clone(),
            goal: view.goal().to_string(),
            status: self.status.read().clone(),
            graph: view.as_ref().clone(),
            pending_intervention: self.gate.pending(),
            last_event_seq: self.ctx.broker().next_seq(&self.ctx.op_id).saturating_sub(1),
            saved_at: Utc::now(),
        };
        if let Err(e) = checkpoints.save(&checkpoint).await {
            warn!(op_id = %self.ctx.op_id, error = %e, "checkpoint write failed");
        }
        self.reflections_since_checkpoint = 0;
    }
}

fn as_object(value: Value) -> serde_json::Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
