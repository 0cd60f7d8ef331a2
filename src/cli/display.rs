use console::style;

use crate::broker::{Event, EventKind};
use crate::operation::{OperationStatus, OutputMode};

/// Console rendering for the CLI.
pub struct Display;

impl Default for Display {
    fn default() -> Self {
        Self::new()
    }
}

impl Display {
    pub fn new() -> Self {
        Self
    }

    pub fn print_success(&self, message: &str) {
        println!("{} {}", style("✓").green().bold(), message);
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("{} {}", style("✗").red().bold(), message);
    }

    pub fn print_info(&self, message: &str) {
        println!("{} {}", style("ℹ").blue(), message);
    }

    pub fn print_warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    /// Render one event according to the operation's output mode.
    pub fn print_event(&self, event: &Event, mode: OutputMode) {
        if !self.should_show(event.event, mode) {
            return;
        }
        let ts = event.timestamp.format("%H:%M:%S");
        let role = event
            .role
            .map(|r| format!(" [{}]", r))
            .unwrap_or_default();
        let detail = self.event_detail(event, mode);
        println!(
            "{} {}{} {}",
            style(format!("[{} #{:>4}]", ts, event.seq)).dim(),
            style(event.event.as_str()).cyan(),
            style(role).magenta(),
            detail
        );
    }

    fn should_show(&self, kind: EventKind, mode: OutputMode) -> bool {
        match mode {
            OutputMode::Debug => true,
            OutputMode::Default => !matches!(kind, EventKind::Heartbeat | EventKind::LlmRequest),
            OutputMode::Simple => matches!(
                kind,
                EventKind::PhaseChanged
                    | EventKind::InterventionRequired
                    | EventKind::InterventionResolved
                    | EventKind::MissionAccomplished
                    | EventKind::OperationAborted
            ),
        }
    }

    fn event_detail(&self, event: &Event, mode: OutputMode) -> String {
        match event.event {
            EventKind::PhaseChanged => event.data["phase"]
                .as_str()
                .unwrap_or_default()
                .to_string(),
            EventKind::GraphChanged => format!(
                "{} command(s) from {}",
                event.data["commands"].as_u64().unwrap_or(0),
                event.data["source"].as_str().unwrap_or("?")
            ),
            EventKind::GraphRejected => format!(
                "batch from {} rejected",
                event.data["source"].as_str().unwrap_or("?")
            ),
            EventKind::ExecutionStepCompleted => format!(
                "{} {} ({})",
                event.data["tool"].as_str().unwrap_or("?"),
                if event.data["ok"].as_bool().unwrap_or(false) {
                    "ok"
                } else {
                    "failed"
                },
                event.data["task_id"].as_str().unwrap_or("?")
            ),
            EventKind::InterventionRequired => format!(
                "request {}",
                event.data["request_id"]
                    .as_str()
                    .unwrap_or(event.data["kind"].as_str().unwrap_or("?"))
            ),
            EventKind::InterventionResolved => format!(
                "request {} -> {}",
                event.data["request_id"].as_str().unwrap_or("?"),
                event.data["action"].as_str().unwrap_or("?")
            ),
            _ if mode == OutputMode::Debug => event.data.to_string(),
            _ => String::new(),
        }
    }

    pub fn print_status(&self, op_id: &str, goal: &str, status: &OperationStatus) {
        let styled = match status {
            OperationStatus::Running => style(status.to_string()).blue(),
            OperationStatus::Succeeded => style(status.to_string()).green(),
            OperationStatus::Failed { .. } => style(status.to_string()).red(),
            OperationStatus::Aborted => style(status.to_string()).yellow(),
            OperationStatus::Stalled { .. } => style(status.to_string()).yellow(),
        };
        println!("{}  {}  {}", style(op_id).bold(), styled, goal);
    }

    pub fn print_operations(&self, rows: &[(String, String, OperationStatus)]) {
        if rows.is_empty() {
            self.print_info("No operations found.");
            return;
        }
        for (op_id, goal, status) in rows {
            self.print_status(op_id, goal, status);
        }
    }

    /// Show a pending plan batch and read the operator's decision line.
    pub fn print_intervention_prompt(&self, request_id: &str, batch: &serde_json::Value) {
        println!();
        self.print_warning(&format!("Intervention required ({})", request_id));
        println!(
            "{}",
            serde_json::to_string_pretty(batch).unwrap_or_else(|_| batch.to_string())
        );
        println!(
            "{}",
            style("Decide: [a]pprove, [r]eject <reason>, [m]odify <file.json>").bold()
        );
    }
}
