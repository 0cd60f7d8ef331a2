use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport-level failure raised by the LLM and tool-host clients.
///
/// Only transient variants are retried; everything else is surfaced
/// immediately and attributed by the reflector.
#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout { operation: String, duration_secs: u64 },
    ConnectionRefused(String),
    BrokenPipe(String),
    RateLimited { retry_after_secs: Option<u64> },
    Http { status: u16, body: String },
    Protocol(String),
}

impl TransportError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::ConnectionRefused(_)
            | Self::BrokenPipe(_)
            | Self::RateLimited { .. } => true,
            Self::Http { status, .. } => matches!(status, 429 | 502 | 503 | 504),
            Self::Protocol(_) => false,
        }
    }

    pub fn suggested_delay(&self, base: Duration) -> Duration {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Duration::from_secs(*secs),
            _ => base,
        }
    }

    /// Classify a reqwest failure into the transport taxonomy.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                operation: "http".to_string(),
                duration_secs: 0,
            };
        }
        if err.is_connect() {
            return Self::ConnectionRefused(err.to_string());
        }
        Self::BrokenPipe(err.to_string())
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout {
                operation,
                duration_secs,
            } => write!(f, "timeout after {}s: {}", duration_secs, operation),
            Self::ConnectionRefused(msg) => write!(f, "connection refused: {}", msg),
            Self::BrokenPipe(msg) => write!(f, "broken pipe: {}", msg),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "rate limited, retry after {}s", secs),
            Self::RateLimited { .. } => write!(f, "rate limited"),
            Self::Http { status, body } => write!(f, "http {}: {}", status, body),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Why a single graph command was refused.
///
/// These names are wire-visible: batch rejections are published verbatim
/// on the `graph.rejected` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    DuplicateId,
    UnknownId,
    Cycle,
    TerminalViolation,
    InvariantViolation,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DuplicateId => "duplicate-id",
            Self::UnknownId => "unknown-id",
            Self::Cycle => "cycle",
            Self::TerminalViolation => "terminal-violation",
            Self::InvariantViolation => "invariant-violation",
        };
        write!(f, "{}", s)
    }
}

/// One rejected command within a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    /// Position of the command within the submitted batch.
    pub index: usize,
    pub reason: RejectReason,
    pub detail: String,
}

impl Rejection {
    pub fn new(index: usize, reason: RejectReason, detail: impl Into<String>) -> Self {
        Self {
            index,
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum RedpilotError {
    #[error("transport failure: {0}")]
    Transport(TransportError),

    #[error("reply failed schema validation after {attempts} attempts: {detail}")]
    Validation { attempts: u32, detail: String },

    #[error("graph batch rejected ({} command(s))", .0.len())]
    Invariant(Vec<Rejection>),

    #[error("budget exhausted: {0}")]
    Budget(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("operation not found: {0}")]
    OperationNotFound(String),

    #[error("over capacity: {running} operations already running (limit {limit})")]
    OverCapacity { running: usize, limit: usize },

    #[error("no pending intervention matches request {0}")]
    UnknownIntervention(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("event log error: {0}")]
    EventLog(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl RedpilotError {
    pub fn transport(err: TransportError) -> Self {
        Self::Transport(err)
    }

    /// Errors that terminate the operation rather than a single step.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Budget(_) | Self::Cancelled(_) | Self::Fatal(_)
        )
    }
}

impl From<TransportError> for RedpilotError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

pub type Result<T> = std::result::Result<T, RedpilotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TransportError::ConnectionRefused("x".into()).is_transient());
        assert!(TransportError::RateLimited {
            retry_after_secs: None
        }
        .is_transient());
        assert!(TransportError::Http {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Http {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!TransportError::Protocol("bad frame".into()).is_transient());
    }

    #[test]
    fn reject_reason_wire_names() {
        let json = serde_json::to_string(&RejectReason::TerminalViolation).unwrap();
        assert_eq!(json, "\"terminal-violation\"");
    }
}
