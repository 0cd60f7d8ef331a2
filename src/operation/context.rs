use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::broker::{Event, EventBroker, EventKind};
use crate::error::{RedpilotError, Result};
use crate::graph::{ApplyOutcome, GraphCommand, GraphStore};
use crate::llm::Role;

/// Per-operation context handed to every component.
///
/// Carries the operation id and its event topic so nothing reaches for a
/// global; the LLM and tool transports are the only things shared across
/// operations.
#[derive(Clone)]
pub struct OpContext {
    pub op_id: String,
    broker: Arc<EventBroker>,
}

impl OpContext {
    pub fn new(op_id: impl Into<String>, broker: Arc<EventBroker>) -> Self {
        Self {
            op_id: op_id.into(),
            broker,
        }
    }

    pub fn broker(&self) -> &Arc<EventBroker> {
        &self.broker
    }

    pub fn emit(&self, kind: EventKind, data: Value) -> Event {
        self.broker.emit(&self.op_id, kind, None, data)
    }

    pub fn emit_role(&self, kind: EventKind, role: Role, data: Value) -> Event {
        self.broker.emit(&self.op_id, kind, Some(role), data)
    }

    /// Apply a batch and publish the outcome.
    ///
    /// Emission happens after the committed state is visible; a rejected
    /// batch publishes a single `graph.rejected` carrying every offending
    /// command.
    pub fn commit(
        &self,
        store: &GraphStore,
        batch: &[GraphCommand],
        source: &str,
    ) -> Result<ApplyOutcome> {
        if batch.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        match store.apply(batch) {
            Ok(outcome) => {
                self.emit(
                    EventKind::GraphChanged,
                    json!({
                        "source": source,
                        "commands": batch.len(),
                        "applied": outcome.applied,
                        "status_changes": &outcome.status_changes,
                    }),
                );
                Ok(outcome)
            }
            Err(RedpilotError::Invariant(rejections)) => {
                debug!(op_id = %self.op_id, source, rejected = rejections.len(), "batch rejected");
                self.emit(
                    EventKind::GraphRejected,
                    json!({ "source": source, "rejections": &rejections }),
                );
                Err(RedpilotError::Invariant(rejections))
            }
            Err(other) => Err(other),
        }
    }
}
