use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::broker::EventKind;
use crate::error::{RedpilotError, Result};
use crate::graph::{validate_batch, GraphCommand};
use crate::operation::OpContext;

/// Human decision on a staged plan batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterventionAction {
    Approve,
    Modify,
    Reject,
}

impl std::fmt::Display for InterventionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Approve => "APPROVE",
            Self::Modify => "MODIFY",
            Self::Reject => "REJECT",
        };
        write!(f, "{}", s)
    }
}

/// Resolved outcome handed back to the scheduler.
#[derive(Debug, Clone)]
pub enum Decision {
    Approved(Vec<GraphCommand>),
    Modified(Vec<GraphCommand>),
    Rejected { reason: String },
}

/// A request visible to the UI while it awaits a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingIntervention {
    pub id: String,
    pub op_id: String,
    pub batch: Vec<GraphCommand>,
    pub created_at: DateTime<Utc>,
}

struct PendingState {
    info: PendingIntervention,
    tx: oneshot::Sender<Decision>,
}

/// Blocks plan application until a human decides, or auto-approves when
/// HITL is off. One request outstanding at a time per operation; repeated
/// submissions for an already-resolved request collapse to no-ops.
pub struct InterventionGate {
    hitl: bool,
    pending: Mutex<Option<PendingState>>,
    resolved_ids: Mutex<HashSet<String>>,
}

impl InterventionGate {
    pub fn new(hitl: bool) -> Self {
        Self {
            hitl,
            pending: Mutex::new(None),
            resolved_ids: Mutex::new(HashSet::new()),
        }
    }

    pub fn hitl_enabled(&self) -> bool {
        self.hitl
    }

    /// The request currently awaiting a decision, if any. Checkpointed so
    /// a UI reconnect after restart sees the same pending request.
    pub fn pending(&self) -> Option<PendingIntervention> {
        self.pending.lock().as_ref().map(|p| p.info.clone())
    }

    /// Stage a batch and suspend until a decision arrives.
    ///
    /// Emits `intervention.required` before blocking and
    /// `intervention.resolved` after; with HITL disabled both still fire
    /// so the event stream reads the same either way.
    pub async fn await_decision(&self, ctx: &OpContext, batch: Vec<GraphCommand>) -> Decision {
        let request_id = format!("req-{}", &uuid::Uuid::new_v4().to_string()[..8]);

        if !self.hitl {
            ctx.emit(
                EventKind::InterventionRequired,
                json!({ "request_id": &request_id, "auto": true, "batch": &batch }),
            );
            ctx.emit(
                EventKind::InterventionResolved,
                json!({ "request_id": &request_id, "action": InterventionAction::Approve, "auto": true }),
            );
            return Decision::Approved(batch);
        }

        let info = PendingIntervention {
            id: request_id.clone(),
            op_id: ctx.op_id.clone(),
            batch: batch.clone(),
            created_at: Utc::now(),
        };
        let (tx, rx) = oneshot::channel();
        *self.pending.lock() = Some(PendingState {
            info: info.clone(),
            tx,
        });

        ctx.emit(
            EventKind::InterventionRequired,
            json!({ "request_id": &request_id, "batch": &batch }),
        );
        info!(op_id = %ctx.op_id, %request_id, "awaiting human decision on plan batch");

        let decision = match rx.await {
            Ok(decision) => decision,
            // The sender half vanished (operation torn down): treat as a
            // rejection so the scheduler can finalize cleanly.
            Err(_) => Decision::Rejected {
                reason: "aborted".to_string(),
            },
        };

        self.resolved_ids.lock().insert(request_id.clone());
        *self.pending.lock() = None;

        let action = match &decision {
            Decision::Approved(_) => InterventionAction::Approve,
            Decision::Modified(_) => InterventionAction::Modify,
            Decision::Rejected { .. } => InterventionAction::Reject,
        };
        ctx.emit(
            EventKind::InterventionResolved,
            json!({ "request_id": &request_id, "action": action }),
        );

        decision
    }

    /// Submit a decision for an outstanding request.
    ///
    /// Duplicate submissions for an already-resolved id are no-ops; an
    /// invalid MODIFY batch leaves the request pending so the human can
    /// correct it.
    pub fn submit(
        &self,
        request_id: &str,
        action: InterventionAction,
        body: Option<Value>,
    ) -> Result<()> {
        let mut pending = self.pending.lock();
        let matches = pending
            .as_ref()
            .map(|p| p.info.id == request_id)
            .unwrap_or(false);

        if !matches {
            if self.resolved_ids.lock().contains(request_id) {
                debug!(request_id, "duplicate intervention response ignored");
                return Ok(());
            }
            return Err(RedpilotError::UnknownIntervention(request_id.to_string()));
        }

        let decision = match action {
            InterventionAction::Approve => {
                let state = pending.as_ref().expect("checked above");
                Decision::Approved(state.info.batch.clone())
            }
            InterventionAction::Modify => {
                let raw = body.ok_or_else(|| {
                    RedpilotError::Config("MODIFY requires a replacement batch".to_string())
                })?;
                let batch: Vec<GraphCommand> = serde_json::from_value(raw)?;
                let rejections = validate_batch(&batch);
                if !rejections.is_empty() {
                    return Err(RedpilotError::Invariant(rejections));
                }
                Decision::Modified(batch)
            }
            InterventionAction::Reject => {
                let reason = body
                    .as_ref()
                    .and_then(|b| b.get("reason").and_then(|r| r.as_str()))
                    .or_else(|| body.as_ref().and_then(|b| b.as_str()))
                    .unwrap_or("rejected by operator")
                    .to_string();
                Decision::Rejected { reason }
            }
        };

        let state = pending.take().expect("checked above");
        self.resolved_ids.lock().insert(request_id.to_string());
        // The receiver may already be gone on teardown; nothing to do then.
        let _ = state.tx.send(decision);
        Ok(())
    }

    /// Abort path: an outstanding request resolves as `REJECT(aborted)`.
    pub fn resolve_aborted(&self) {
        if let Some(state) = self.pending.lock().take() {
            let _ = state.tx.send(Decision::Rejected {
                reason: "aborted".to_string(),
            });
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::EventBroker;
    use crate::config::BrokerConfig;
    use crate::graph::NodeDraft;
    use std::sync::Arc;

    fn ctx() -> OpContext {
        OpContext::new("op-test", Arc::new(EventBroker::new(BrokerConfig::default())))
    }

    fn batch() -> Vec<GraphCommand> {
        vec![GraphCommand::AddNode {
            node_data: NodeDraft::task("t1", "probe"),
        }]
    }

    #[tokio::test]
    async fn auto_approves_without_hitl() {
        let gate = InterventionGate::new(false);
        match gate.await_decision(&ctx(), batch()).await {
            Decision::Approved(commands) => assert_eq!(commands.len(), 1),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[tokio::test]
    async fn approve_resolves_waiter() {
        let gate = Arc::new(InterventionGate::new(true));
        let ctx = ctx();

        let waiter = {
            let gate = gate.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { gate.await_decision(&ctx, batch()).await })
        };

        // Wait for the request to be staged.
        let request_id = loop {
            if let Some(pending) = gate.pending() {
                break pending.id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        gate.submit(&request_id, InterventionAction::Approve, None)
            .unwrap();
        match waiter.await.unwrap() {
            Decision::Approved(commands) => assert_eq!(commands.len(), 1),
            other => panic!("unexpected decision: {:?}", other),
        }

        // A second APPROVE for the same id collapses to a no-op.
        gate.submit(&request_id, InterventionAction::Approve, None)
            .unwrap();
    }

    #[tokio::test]
    async fn modify_replaces_the_batch() {
        let gate = Arc::new(InterventionGate::new(true));
        let ctx = ctx();

        let waiter = {
            let gate = gate.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { gate.await_decision(&ctx, batch()).await })
        };
        let request_id = loop {
            if let Some(pending) = gate.pending() {
                break pending.id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        let replacement = serde_json::json!([
            {"command": "ADD_NODE", "node_data": {"id": "t1b", "kind": "task", "description": "x"}},
            {"command": "ADD_NODE", "node_data": {"id": "t1c", "kind": "task", "description": "y"}}
        ]);
        gate.submit(&request_id, InterventionAction::Modify, Some(replacement))
            .unwrap();

        match waiter.await.unwrap() {
            Decision::Modified(commands) => assert_eq!(commands.len(), 2),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_modify_keeps_request_pending() {
        let gate = Arc::new(InterventionGate::new(true));
        let ctx = ctx();

        let _waiter = {
            let gate = gate.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { gate.await_decision(&ctx, batch()).await })
        };
        let request_id = loop {
            if let Some(pending) = gate.pending() {
                break pending.id;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        };

        // Empty id is structurally invalid.
        let bad = serde_json::json!([
            {"command": "ADD_NODE", "node_data": {"id": "", "description": "x"}}
        ]);
        assert!(gate
            .submit(&request_id, InterventionAction::Modify, Some(bad))
            .is_err());
        assert!(gate.has_pending());
    }

    #[tokio::test]
    async fn abort_resolves_as_rejected() {
        let gate = Arc::new(InterventionGate::new(true));
        let ctx = ctx();

        let waiter = {
            let gate = gate.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { gate.await_decision(&ctx, batch()).await })
        };
        while !gate.has_pending() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        gate.resolve_aborted();
        match waiter.await.unwrap() {
            Decision::Rejected { reason } => assert_eq!(reason, "aborted"),
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_request_is_an_error() {
        let gate = InterventionGate::new(true);
        assert!(matches!(
            gate.submit("req-nope", InterventionAction::Approve, None),
            Err(RedpilotError::UnknownIntervention(_))
        ));
    }
}
