use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::RejectReason;

/// Closed set of belief-graph node variants.
///
/// The ladder runs evidence -> hypothesis -> vulnerability ->
/// confirmed vulnerability -> flag; promotion up the ladder is gated by
/// the store's edge invariants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CausalKind {
    KeyFact,
    Evidence,
    Hypothesis,
    Vulnerability,
    ConfirmedVulnerability,
    Flag,
}

impl CausalKind {
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::KeyFact => "kf",
            Self::Evidence => "ev",
            Self::Hypothesis => "hyp",
            Self::Vulnerability => "vuln",
            Self::ConfirmedVulnerability => "cvuln",
            Self::Flag => "flag",
        }
    }

    /// Variants that may serve as grounding for a hypothesis promotion.
    pub fn is_grounding(&self) -> bool {
        matches!(self, Self::Evidence | Self::KeyFact)
    }
}

impl std::fmt::Display for CausalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::KeyFact => "key_fact",
            Self::Evidence => "evidence",
            Self::Hypothesis => "hypothesis",
            Self::Vulnerability => "vulnerability",
            Self::ConfirmedVulnerability => "confirmed_vulnerability",
            Self::Flag => "flag",
        };
        write!(f, "{}", s)
    }
}

/// Edge labels in the belief graph. Closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CausalRelation {
    Supports,
    Contradicts,
    Validates,
    Reveals,
    Exploits,
    Mitigates,
}

impl std::fmt::Display for CausalRelation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Supports => "supports",
            Self::Contradicts => "contradicts",
            Self::Validates => "validates",
            Self::Reveals => "reveals",
            Self::Exploits => "exploits",
            Self::Mitigates => "mitigates",
        };
        write!(f, "{}", s)
    }
}

/// A node in the causal/belief graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalNode {
    pub id: String,
    pub kind: CausalKind,
    pub description: String,

    /// Required for hypotheses, optional elsewhere. Always in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Action node whose artifact produced this belief.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_action_id: Option<String>,

    #[serde(default)]
    pub deprecated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Variant-specific payload carried verbatim (hosts, ports, payloads...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

impl CausalNode {
    /// Partial merge of a wire `updates` object.
    ///
    /// Kind promotions are validated by the store, which can see the edge
    /// set; this handles the node-local fields. Lowering confidence
    /// requires a `rationale` alongside it.
    pub(super) fn apply_updates(
        &mut self,
        updates: &serde_json::Map<String, Value>,
    ) -> Result<Option<CausalKind>, (RejectReason, String)> {
        let mut promoted = None;

        for (key, value) in updates {
            match key.as_str() {
                "description" => {
                    self.description = as_string(&self.id, key, value)?;
                }
                "confidence" => {
                    let new = value.as_f64().ok_or_else(|| {
                        (
                            RejectReason::InvariantViolation,
                            format!("confidence on {} must be a number", self.id),
                        )
                    })?;
                    if !(0.0..=1.0).contains(&new) {
                        return Err((
                            RejectReason::InvariantViolation,
                            format!("confidence on {} out of [0,1]: {}", self.id, new),
                        ));
                    }
                    let old = self.confidence.unwrap_or(0.0);
                    if new < old && !updates.contains_key("rationale") {
                        return Err((
                            RejectReason::InvariantViolation,
                            format!(
                                "lowering confidence on {} ({:.2} -> {:.2}) requires a rationale",
                                self.id, old, new
                            ),
                        ));
                    }
                    self.confidence = Some(new);
                }
                "rationale" => {
                    let rationale = as_string(&self.id, key, value)?;
                    self.extra
                        .insert("rationale".to_string(), Value::String(rationale));
                }
                "kind" => {
                    let kind: CausalKind = serde_json::from_value(value.clone()).map_err(|e| {
                        (
                            RejectReason::InvariantViolation,
                            format!("invalid kind for {}: {}", self.id, e),
                        )
                    })?;
                    if kind != self.kind {
                        promoted = Some(kind);
                    }
                }
                other => {
                    // Variant-specific payload fields merge into `extra`.
                    self.extra.insert(other.to_string(), value.clone());
                }
            }
        }

        Ok(promoted)
    }
}

fn as_string(id: &str, key: &str, value: &Value) -> Result<String, (RejectReason, String)> {
    value
        .as_str()
        .map(|s| s.to_string())
        .ok_or_else(|| {
            (
                RejectReason::InvariantViolation,
                format!("`{}` on {} must be a string", key, id),
            )
        })
}

/// Wire shape of `ADD_CAUSAL_NODE`'s `fields`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CausalDraft {
    /// Optional explicit id; derived from content when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_action_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl CausalDraft {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: None,
            description: description.into(),
            confidence: None,
            source_action_id: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_source_action(mut self, action_id: impl Into<String>) -> Self {
        self.source_action_id = Some(action_id.into());
        self
    }

    /// Materialize the draft, deriving an id when none was supplied.
    ///
    /// Key facts get content-addressed ids so the same distilled fact
    /// staged twice collapses to one node.
    pub fn into_node(self, kind: CausalKind) -> CausalNode {
        let id = match (self.id, kind) {
            (Some(id), _) => id,
            (None, CausalKind::KeyFact) => content_id(kind, &self.description),
            (None, _) => format!("{}-{}", kind.id_prefix(), &uuid::Uuid::new_v4().to_string()[..8]),
        };
        CausalNode {
            id,
            kind,
            description: self.description,
            confidence: self.confidence,
            source_action_id: self.source_action_id,
            deprecated: false,
            deprecated_reason: None,
            created_at: Utc::now(),
            extra: self.extra,
        }
    }

    /// True if the id would be derived rather than caller-supplied.
    pub fn is_auto_id(&self) -> bool {
        self.id.is_none()
    }
}

fn content_id(kind: CausalKind, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.trim().to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest[..6].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", kind.id_prefix(), hex)
}

/// An edge in the belief graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CausalEdge {
    pub source: String,
    pub target: String,
    pub relation: CausalRelation,
    pub confidence: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_fact_ids_are_content_addressed() {
        let a = CausalDraft::new("login form present").into_node(CausalKind::KeyFact);
        let b = CausalDraft::new("  Login form PRESENT ").into_node(CausalKind::KeyFact);
        assert_eq!(a.id, b.id);

        let c = CausalDraft::new("admin panel exposed").into_node(CausalKind::KeyFact);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn lowering_confidence_requires_rationale() {
        let mut node = CausalDraft::new("sqli in /login")
            .with_confidence(0.8)
            .into_node(CausalKind::Hypothesis);

        let updates = json!({"confidence": 0.3});
        assert!(node.apply_updates(updates.as_object().unwrap()).is_err());

        let updates = json!({"confidence": 0.3, "rationale": "WAF blocks payloads"});
        assert!(node.apply_updates(updates.as_object().unwrap()).is_ok());
        assert_eq!(node.confidence, Some(0.3));
    }

    #[test]
    fn raising_confidence_needs_no_rationale() {
        let mut node = CausalDraft::new("sqli in /login")
            .with_confidence(0.4)
            .into_node(CausalKind::Hypothesis);
        let updates = json!({"confidence": 0.9});
        assert!(node.apply_updates(updates.as_object().unwrap()).is_ok());
    }

    #[test]
    fn relation_wire_names() {
        assert_eq!(
            serde_json::to_string(&CausalRelation::Supports).unwrap(),
            "\"supports\""
        );
    }
}
