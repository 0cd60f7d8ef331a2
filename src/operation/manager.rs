use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{EventBroker, EventKind, EventStream};
use crate::config::{RedpilotConfig, StateDir};
use crate::error::{RedpilotError, Result};
use crate::graph::{validate_batch, GraphCommand, GraphStore, NodeDraft};
use crate::guidance::GuidanceSource;
use crate::intervention::{InterventionAction, InterventionGate};
use crate::llm::{LlmClient, Role};
use crate::persist::{CheckpointStore, EventLog};
use crate::scheduler::{AbortSignal, Scheduler};
use crate::tools::ToolHost;

use super::context::OpContext;
use super::types::{OperationOpts, OperationStatus};

/// Which half of the dual graph a snapshot call wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphSelector {
    Task,
    Causal,
}

struct OperationHandle {
    goal: String,
    store: Arc<GraphStore>,
    gate: Arc<InterventionGate>,
    signal: Arc<AbortSignal>,
    status: Arc<RwLock<OperationStatus>>,
    join: Mutex<Option<JoinHandle<OperationStatus>>>,
}

/// Owns the shared ports and every live operation.
///
/// Operations are fully isolated from each other: each gets its own graph
/// store, gate, abort signal and event topic; only the LLM and tool
/// transports (and this registry) are shared.
pub struct OperationManager {
    config: RedpilotConfig,
    broker: Arc<EventBroker>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolHost>,
    guidance: Arc<dyn GuidanceSource>,
    checkpoints: Arc<CheckpointStore>,
    event_log: Option<EventLog>,
    ops: DashMap<String, Arc<OperationHandle>>,
}

impl OperationManager {
    pub async fn new(
        config: RedpilotConfig,
        state_dir: &StateDir,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolHost>,
        guidance: Arc<dyn GuidanceSource>,
    ) -> Result<Self> {
        state_dir.ensure_dirs().await?;
        let checkpoints = Arc::new(CheckpointStore::new(state_dir.operations_dir()));
        checkpoints.init().await?;

        let event_log = match EventLog::open(state_dir.event_db_path(), config.persist.event_tail) {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(error = %e, "event log unavailable, replay-from-disk disabled");
                None
            }
        };

        Ok(Self {
            broker: Arc::new(EventBroker::new(config.broker.clone())),
            config,
            llm,
            tools,
            guidance,
            checkpoints,
            event_log,
            ops: DashMap::new(),
        })
    }

    /// Create and launch a new operation. Fails with `over-capacity` when
    /// too many operations are already running.
    pub async fn start_operation(&self, goal: &str, opts: OperationOpts) -> Result<String> {
        let running = self
            .ops
            .iter()
            .filter(|entry| !entry.value().status.read().is_terminal())
            .count();
        let limit = self.config.operation.capacity;
        if running >= limit {
            return Err(RedpilotError::OverCapacity { running, limit });
        }

        let op_id = format!("op-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let config = self.merged_config(&opts);

        let store = Arc::new(GraphStore::new(goal));
        let gate = Arc::new(InterventionGate::new(config.operation.hitl));
        let signal = Arc::new(AbortSignal::new());
        let status = Arc::new(RwLock::new(OperationStatus::Running));
        let ctx = OpContext::new(op_id.clone(), self.broker.clone());

        // Persistence pump: every event lands in the on-disk tail.
        if let Some(log) = &self.event_log {
            let log = log.clone();
            let mut stream = self.broker.subscribe(&op_id, None);
            let pump_op_id = op_id.clone();
            tokio::spawn(async move {
                while let Some(event) = stream.recv().await {
                    if let Err(e) = log.append(&pump_op_id, &event).await {
                        warn!(op_id = %pump_op_id, error = %e, "event append failed");
                    }
                }
            });
        }

        let scheduler = Scheduler::new(
            ctx,
            store.clone(),
            self.llm.clone(),
            self.tools.clone(),
            self.guidance.clone(),
            gate.clone(),
            signal.clone(),
            status.clone(),
            Some(self.checkpoints.clone()),
            &config,
        );

        let broker = self.broker.clone();
        let scheduler_op_id = op_id.clone();
        let join = tokio::spawn(async move {
            let final_status = scheduler.run().await;
            broker.close_topic(&scheduler_op_id);
            final_status
        });

        self.ops.insert(
            op_id.clone(),
            Arc::new(OperationHandle {
                goal: goal.to_string(),
                store,
                gate,
                signal,
                status,
                join: Mutex::new(Some(join)),
            }),
        );

        info!(%op_id, goal, "operation started");
        Ok(op_id)
    }

    /// Request cancellation. Idempotent: aborting a finished or already
    /// aborting operation is a no-op.
    pub async fn abort_operation(&self, op_id: &str) -> Result<()> {
        if let Some(handle) = self.ops.get(op_id) {
            handle.signal.trigger();
            handle.gate.resolve_aborted();
            return Ok(());
        }
        // Already finished and unloaded: aborting a terminal operation is
        // a no-op, not an error.
        self.checkpoints.load(op_id).await.map(|_| ())
    }

    /// Live event stream, optionally replaying from a sequence number.
    pub fn subscribe(&self, op_id: &str, from_seq: Option<u64>) -> Result<EventStream> {
        if !self.ops.contains_key(op_id) {
            return Err(RedpilotError::OperationNotFound(op_id.to_string()));
        }
        Ok(self.broker.subscribe(op_id, from_seq))
    }

    /// Route a human decision to whichever operation holds the request.
    pub fn submit_intervention(
        &self,
        request_id: &str,
        action: InterventionAction,
        body: Option<Value>,
    ) -> Result<()> {
        for entry in self.ops.iter() {
            match entry.value().gate.submit(request_id, action, body.clone()) {
                Ok(()) => return Ok(()),
                Err(RedpilotError::UnknownIntervention(_)) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(RedpilotError::UnknownIntervention(request_id.to_string()))
    }

    /// Out-of-band task injection: a human-authored batch that skips the
    /// planner but not the gate's validation and event contract.
    pub fn inject_task(&self, op_id: &str, description: &str, deps: Vec<String>) -> Result<String> {
        let handle = self
            .ops
            .get(op_id)
            .ok_or_else(|| RedpilotError::OperationNotFound(op_id.to_string()))?;

        let task_id = format!("t-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        let batch = vec![GraphCommand::AddNode {
            node_data: NodeDraft::task(&task_id, description).with_dependencies(deps),
        }];
        let rejections = validate_batch(&batch);
        if !rejections.is_empty() {
            return Err(RedpilotError::Invariant(rejections));
        }

        let ctx = OpContext::new(op_id, self.broker.clone());
        let request_id = format!("req-{}", &uuid::Uuid::new_v4().to_string()[..8]);
        ctx.emit(
            EventKind::InterventionRequired,
            json!({ "request_id": &request_id, "batch": &batch, "injected": true }),
        );
        ctx.commit(&handle.store, &batch, "human")?;
        ctx.emit(
            EventKind::InterventionResolved,
            json!({ "request_id": &request_id, "action": InterventionAction::Approve, "injected": true }),
        );

        info!(op_id, %task_id, "task injected by operator");
        Ok(task_id)
    }

    /// Current graph view, reduced to the requested half.
    pub async fn snapshot(&self, op_id: &str, selector: GraphSelector) -> Result<Value> {
        // Clone out of the registry before awaiting; the map guard must
        // not live across a suspension point.
        let live = self
            .ops
            .get(op_id)
            .map(|handle| handle.store.snapshot().as_ref().clone());
        let state = match live {
            Some(state) => state,
            None => self.checkpoints.load(op_id).await?.graph,
        };

        let view = match selector {
            GraphSelector::Task => json!({
                "root_id": state.root_id,
                "tasks": state.tasks,
            }),
            GraphSelector::Causal => json!({
                "nodes": state.causal_nodes,
                "edges": state.causal_edges,
            }),
        };
        Ok(view)
    }

    pub async fn status(&self, op_id: &str) -> Result<OperationStatus> {
        if let Some(handle) = self.ops.get(op_id) {
            return Ok(handle.status.read().clone());
        }
        Ok(self.checkpoints.load(op_id).await?.status)
    }

    /// Live operations plus anything checkpointed on disk.
    pub async fn list(&self) -> Result<Vec<(String, String, OperationStatus)>> {
        let mut out: Vec<(String, String, OperationStatus)> = self
            .ops
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().goal.clone(),
                    e.value().status.read().clone(),
                )
            })
            .collect();

        for checkpoint in self.checkpoints.list().await.unwrap_or_default() {
            if !out.iter().any(|(id, _, _)| id == &checkpoint.op_id) {
                out.push((checkpoint.op_id, checkpoint.goal, checkpoint.status));
            }
        }
        Ok(out)
    }

    /// Block until the operation reaches a terminal state.
    pub async fn wait(&self, op_id: &str) -> Result<OperationStatus> {
        let join = {
            let handle = self
                .ops
                .get(op_id)
                .ok_or_else(|| RedpilotError::OperationNotFound(op_id.to_string()))?;
            let taken = handle.join.lock().take();
            taken
        };

        match join {
            Some(join) => join
                .await
                .map_err(|e| RedpilotError::Fatal(format!("scheduler task died: {}", e))),
            None => self.status(op_id).await,
        }
    }

    /// Replayable event tail from disk, for post-mortem inspection.
    pub async fn event_tail(&self, op_id: &str, from_seq: u64) -> Result<Vec<crate::broker::Event>> {
        match &self.event_log {
            Some(log) => log.tail(op_id, from_seq).await,
            None => Ok(self.broker.replay(op_id, from_seq)),
        }
    }

    fn merged_config(&self, opts: &OperationOpts) -> RedpilotConfig {
        let mut config = self.config.clone();
        if let Some(max_parallel) = opts.max_parallel {
            config.operation.max_parallel = max_parallel;
        }
        if let Some(step_budget) = opts.step_budget {
            config.operation.step_budget = step_budget;
        }
        if let Some(hitl) = opts.hitl {
            config.operation.hitl = hitl;
        }
        if let Some(model) = &opts.planner_model {
            config.models.override_role(Role::Planner, model.clone());
        }
        if let Some(model) = &opts.executor_model {
            config.models.override_role(Role::Executor, model.clone());
        }
        if let Some(model) = &opts.reflector_model {
            config.models.override_role(Role::Reflector, model.clone());
        }
        config
    }
}
