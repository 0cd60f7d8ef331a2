use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RejectReason, Rejection};

use super::causal::{CausalDraft, CausalKind, CausalRelation};
use super::node::NodeDraft;

/// The graph mutation instruction set.
///
/// Every change to either graph travels through this tagged union: the
/// planner and reflector emit batches of these over the wire, the human
/// may edit them at the intervention gate, and the store applies them
/// atomically.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "command")]
pub enum GraphCommand {
    #[serde(rename = "ADD_NODE")]
    AddNode { node_data: NodeDraft },

    #[serde(rename = "UPDATE_NODE")]
    UpdateNode {
        id: String,
        updates: serde_json::Map<String, Value>,
    },

    #[serde(rename = "ADD_EDGE")]
    AddEdge {
        source: String,
        target: String,
        relation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f64>,
    },

    #[serde(rename = "DEPRECATE_NODE")]
    DeprecateNode { id: String, reason: String },

    #[serde(rename = "ADD_CAUSAL_NODE")]
    AddCausalNode {
        variant: CausalKind,
        fields: CausalDraft,
    },

    #[serde(rename = "ADD_CAUSAL_EDGE")]
    AddCausalEdge {
        source: String,
        target: String,
        relation: CausalRelation,
        confidence: f64,
    },
}

/// The only relation admitted on task-DAG edges: `source` depends on
/// `target`.
pub const TASK_EDGE_RELATION: &str = "depends_on";

impl GraphCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddNode { .. } => "ADD_NODE",
            Self::UpdateNode { .. } => "UPDATE_NODE",
            Self::AddEdge { .. } => "ADD_EDGE",
            Self::DeprecateNode { .. } => "DEPRECATE_NODE",
            Self::AddCausalNode { .. } => "ADD_CAUSAL_NODE",
            Self::AddCausalEdge { .. } => "ADD_CAUSAL_EDGE",
        }
    }

    /// Structural validation that needs no graph state.
    fn validate(&self) -> Result<(), (RejectReason, String)> {
        match self {
            Self::AddNode { node_data } => {
                if node_data.id.trim().is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "node id must be non-empty".to_string(),
                    ));
                }
            }
            Self::UpdateNode { id, updates } => {
                if id.trim().is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "update target id must be non-empty".to_string(),
                    ));
                }
                if updates.is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        format!("empty updates for {}", id),
                    ));
                }
            }
            Self::AddEdge {
                source,
                target,
                relation,
                confidence,
            } => {
                if source.trim().is_empty() || target.trim().is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "edge endpoints must be non-empty".to_string(),
                    ));
                }
                if relation != TASK_EDGE_RELATION {
                    return Err((
                        RejectReason::InvariantViolation,
                        format!("unknown task edge relation `{}`", relation),
                    ));
                }
                if let Some(c) = confidence {
                    check_confidence(*c)?;
                }
            }
            Self::DeprecateNode { id, .. } => {
                if id.trim().is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "deprecate target id must be non-empty".to_string(),
                    ));
                }
            }
            Self::AddCausalNode { variant, fields } => {
                if fields.description.trim().is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "causal node description must be non-empty".to_string(),
                    ));
                }
                if let Some(c) = fields.confidence {
                    check_confidence(c)?;
                }
                if *variant == CausalKind::Hypothesis && fields.confidence.is_none() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "hypotheses require a confidence".to_string(),
                    ));
                }
            }
            Self::AddCausalEdge {
                source,
                target,
                confidence,
                ..
            } => {
                if source.trim().is_empty() || target.trim().is_empty() {
                    return Err((
                        RejectReason::InvariantViolation,
                        "edge endpoints must be non-empty".to_string(),
                    ));
                }
                check_confidence(*confidence)?;
            }
        }
        Ok(())
    }
}

fn check_confidence(c: f64) -> Result<(), (RejectReason, String)> {
    if (0.0..=1.0).contains(&c) {
        Ok(())
    } else {
        Err((
            RejectReason::InvariantViolation,
            format!("confidence out of [0,1]: {}", c),
        ))
    }
}

/// Validate a whole batch structurally, before it reaches the gate or the
/// store. Returns one rejection per offending command.
pub fn validate_batch(batch: &[GraphCommand]) -> Vec<Rejection> {
    batch
        .iter()
        .enumerate()
        .filter_map(|(index, command)| {
            command
                .validate()
                .err()
                .map(|(reason, detail)| Rejection::new(index, reason, detail))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_round_trip() {
        let json = json!({
            "command": "ADD_NODE",
            "node_data": {"id": "t1", "kind": "task", "description": "probe /login"}
        });
        let cmd: GraphCommand = serde_json::from_value(json).unwrap();
        assert_eq!(cmd.name(), "ADD_NODE");

        let back = serde_json::to_value(&cmd).unwrap();
        assert_eq!(back["command"], "ADD_NODE");
        assert_eq!(back["node_data"]["id"], "t1");
    }

    #[test]
    fn causal_edge_wire_format() {
        let json = json!({
            "command": "ADD_CAUSAL_EDGE",
            "source": "ev-1",
            "target": "hyp-1",
            "relation": "supports",
            "confidence": 0.8
        });
        let cmd: GraphCommand = serde_json::from_value(json).unwrap();
        assert_eq!(cmd.name(), "ADD_CAUSAL_EDGE");
    }

    #[test]
    fn unknown_command_tag_is_rejected() {
        let json = json!({"command": "DELETE_NODE", "id": "t1"});
        assert!(serde_json::from_value::<GraphCommand>(json).is_err());
    }

    #[test]
    fn batch_validation_flags_bad_commands() {
        let batch = vec![
            GraphCommand::AddNode {
                node_data: NodeDraft::task("t1", "ok"),
            },
            GraphCommand::AddCausalEdge {
                source: "a".into(),
                target: "b".into(),
                relation: CausalRelation::Supports,
                confidence: 1.5,
            },
        ];
        let rejections = validate_batch(&batch);
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].index, 1);
        assert_eq!(rejections[0].reason, RejectReason::InvariantViolation);
    }

    #[test]
    fn hypothesis_without_confidence_is_invalid() {
        let batch = vec![GraphCommand::AddCausalNode {
            variant: CausalKind::Hypothesis,
            fields: CausalDraft::new("weak credentials accepted"),
        }];
        assert_eq!(validate_batch(&batch).len(), 1);
    }
}
