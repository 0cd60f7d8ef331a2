use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool advertised by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON schema of the tool's arguments, passed through verbatim.
    #[serde(default)]
    pub schema: Value,
}

impl ToolSpec {
    /// One line per tool for the executor prompt.
    pub fn render_line(&self) -> String {
        if self.description.is_empty() {
            format!("- {}", self.name)
        } else {
            format!("- {}: {}", self.name, self.description)
        }
    }
}

/// Outcome of a single tool invocation, after transport retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ToolOutcome {
    /// The tool ran; `truncated` marks output clipped to the byte budget.
    Success { output: String, truncated: bool },
    /// The tool itself reported failure.
    Failure { message: String },
    /// The per-call deadline elapsed.
    TimedOut,
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Text shown to the model as the observation for this action.
    pub fn observation(&self) -> String {
        match self {
            Self::Success { output, .. } => output.clone(),
            Self::Failure { message } => format!("tool failed: {}", message),
            Self::TimedOut => "tool call timed out".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_observation_text() {
        let ok = ToolOutcome::Success {
            output: "200 OK".into(),
            truncated: false,
        };
        assert!(ok.is_success());
        assert_eq!(ok.observation(), "200 OK");
        assert_eq!(ToolOutcome::TimedOut.observation(), "tool call timed out");
    }
}
